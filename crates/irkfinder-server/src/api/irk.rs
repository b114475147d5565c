//! Identity key API endpoints.
//!
//! Exposes the captured key in every encoding and lets the operator start
//! over by clearing the session and all bonds.

use axum::extract::State;
use axum::Json;
use chrono::SecondsFormat;
use irkfinder_core::{CaptureSource, SessionSnapshot};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Placeholder shown for the peer address before a key is captured.
const NO_PEER: &str = "None";

// ============================================================================
// Request/Response Types
// ============================================================================

/// Captured identity key status.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "irk": "00112233445566778899aabbccddeeff",
    "irk_reversed": "ffeeddccbbaa99887766554433221100",
    "irk_base64": "ABEiM0RVZneImaq7zN3u/w==",
    "irk_array": "0x00,0x11,0x22,0x33,0x44,0x55,0x66,0x77,0x88,0x99,0xaa,0xbb,0xcc,0xdd,0xee,0xff",
    "mac": "5C:11:22:33:44:55",
    "irk_retrieved": true,
    "retrieved_at_utc": "2025-01-15T03:30:00Z",
    "source": "key_exchange"
}))]
pub struct IrkStatusResponse {
    /// Key as lowercase hex; empty before retrieval.
    #[schema(example = "00112233445566778899aabbccddeeff")]
    pub irk: String,

    /// Byte-reversed key as lowercase hex (ESPresense's format).
    #[schema(example = "ffeeddccbbaa99887766554433221100")]
    pub irk_reversed: String,

    /// Key as padded base64 (Home Assistant's Private BLE Device format).
    #[schema(example = "ABEiM0RVZneImaq7zN3u/w==")]
    pub irk_base64: String,

    /// Key as a C array initializer.
    pub irk_array: String,

    /// Identity address of the peer the key belongs to, or `"None"`.
    #[schema(example = "5C:11:22:33:44:55")]
    pub mac: String,

    /// Whether a key has been captured.
    #[schema(example = true)]
    pub irk_retrieved: bool,

    /// When the key was captured (RFC 3339).
    #[schema(nullable)]
    pub retrieved_at_utc: Option<String>,

    /// How the key was captured.
    #[schema(nullable)]
    pub source: Option<CaptureSource>,
}

impl From<SessionSnapshot> for IrkStatusResponse {
    fn from(snapshot: SessionSnapshot) -> Self {
        let encodings = snapshot.encodings().cloned().unwrap_or_default();
        Self {
            irk: encodings.hex,
            irk_reversed: encodings.reversed_hex,
            irk_base64: encodings.base64,
            irk_array: encodings.array_literal,
            mac: snapshot
                .peer_address()
                .map_or_else(|| NO_PEER.to_string(), |a| a.to_string()),
            irk_retrieved: snapshot.is_retrieved(),
            retrieved_at_utc: snapshot
                .retrieved_at()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            source: snapshot.source(),
        }
    }
}

/// Reset response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "success": true,
    "removed_bonds": 1
}))]
pub struct ResetResponse {
    /// Whether the session was cleared and every bond removed.
    #[schema(example = true)]
    pub success: bool,

    /// Number of bonds removed.
    #[schema(example = 1)]
    pub removed_bonds: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the captured identity key.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "irk",
    operation_id = "getStatus",
    summary = "Get the captured identity key",
    description = "Returns the phone's Identity Resolving Key in hex, reversed hex, base64 \
        and array form, plus the phone's identity address. Before a phone has paired, \
        the encodings are empty strings, `mac` is \"None\" and `irk_retrieved` is false.",
    responses(
        (status = 200, description = "Current key status", body = IrkStatusResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> Json<IrkStatusResponse> {
    Json(state.session().read().into())
}

/// Clear the captured key and remove every bond.
#[utoipa::path(
    post,
    path = "/api/reset",
    tag = "irk",
    operation_id = "reset",
    summary = "Forget the key and all bonds",
    description = "Clears the captured key and deletes every bonded device so the next \
        phone can pair from scratch. The captured key is cleared even if bond removal \
        fails.",
    responses(
        (status = 200, description = "Session cleared and bonds removed", body = ResetResponse),
        (status = 500, description = "Bond removal failed", body = super::error::ErrorResponse)
    )
)]
pub async fn reset(State(state): State<SharedState>) -> ApiResult<Json<ResetResponse>> {
    let session = state.session().clone();
    let removed = tokio::task::spawn_blocking(move || session.reset())
        .await
        .map_err(|e| ApiError::InternalError {
            error_code: "reset_failed".to_string(),
            message: "Reset task failed".to_string(),
            details: Some(e.to_string()),
        })?
        .map_err(ApiError::reset_failed)?;

    Ok(Json(ResetResponse {
        success: true,
        removed_bonds: removed,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use axum_test::TestServer;
    use irkfinder_core::{
        Address, BondedDeviceStore, BondedPeer, BringUpStatus, IdentityKey, MemoryBondDatabase,
        Session,
    };
    use tokio::sync::watch;

    use super::*;
    use crate::api::create_router;
    use crate::state::AppState;

    const PHONE: Address = Address::new([0x5C, 0x11, 0x22, 0x33, 0x44, 0x55]);

    fn test_key() -> IdentityKey {
        IdentityKey::from_bytes([
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ])
    }

    fn server(db: Arc<MemoryBondDatabase>) -> (TestServer, Arc<Session>) {
        let session = Session::new(BondedDeviceStore::new(db));
        let (_tx, rx) = watch::channel(BringUpStatus::default());
        let app = create_router(AppState::new(session.clone(), rx));
        (TestServer::new(app).unwrap(), session)
    }

    #[test]
    fn test_status_before_retrieval() {
        let status = IrkStatusResponse::from(SessionSnapshot::default());
        assert_eq!(status.irk, "");
        assert_eq!(status.irk_base64, "");
        assert_eq!(status.mac, "None");
        assert!(!status.irk_retrieved);
        assert!(status.retrieved_at_utc.is_none());
    }

    #[tokio::test]
    async fn test_get_status_after_capture() {
        let (server, session) = server(Arc::new(MemoryBondDatabase::default()));
        session.capture(PHONE, test_key(), CaptureSource::KeyExchange);

        let response = server.get("/api/status").await;
        response.assert_status_ok();
        let status: IrkStatusResponse = response.json();
        assert_eq!(status.irk, "00112233445566778899aabbccddeeff");
        assert_eq!(status.irk_reversed, "ffeeddccbbaa99887766554433221100");
        assert_eq!(status.irk_base64, "ABEiM0RVZneImaq7zN3u/w==");
        assert!(status.irk_array.starts_with("0x00,0x11,"));
        assert_eq!(status.mac, "5C:11:22:33:44:55");
        assert!(status.irk_retrieved);
        assert!(status.retrieved_at_utc.is_some());
        assert_eq!(status.source, Some(CaptureSource::KeyExchange));
    }

    #[tokio::test]
    async fn test_reset_clears_session_and_bonds() {
        let db = Arc::new(MemoryBondDatabase::with_peers(vec![BondedPeer {
            address: PHONE,
            identity_key: Some(test_key()),
        }]));
        let (server, session) = server(db.clone());
        session.capture(PHONE, test_key(), CaptureSource::BondEnumeration);

        let response = server.post("/api/reset").await;
        response.assert_status_ok();
        let body: ResetResponse = response.json();
        assert!(body.success);
        assert_eq!(body.removed_bonds, 1);
        assert!(db.is_empty());

        let status: IrkStatusResponse = server.get("/api/status").await.json();
        assert!(!status.irk_retrieved);
        assert_eq!(status.mac, "None");
    }

    #[tokio::test]
    async fn test_reset_with_no_bonds() {
        let (server, _) = server(Arc::new(MemoryBondDatabase::default()));
        let body: ResetResponse = server.post("/api/reset").await.json();
        assert!(body.success);
        assert_eq!(body.removed_bonds, 0);
    }

    #[tokio::test]
    async fn test_reset_store_failure_is_500() {
        let db = Arc::new(MemoryBondDatabase::default());
        db.set_unavailable(true);
        let (server, session) = server(db);
        session.capture(PHONE, test_key(), CaptureSource::KeyExchange);

        let response = server.post("/api/reset").expect_failure().await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"], "reset_failed");
        assert!(!session.is_retrieved());
    }
}
