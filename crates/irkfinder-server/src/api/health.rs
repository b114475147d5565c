//! Health check API endpoint.
//!
//! Reports liveness plus how far the BLE bring-up has progressed.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::state::SharedState;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "ok",
    "version": "0.1.0",
    "advertising": true,
    "service_started": true
}))]
pub struct HealthResponse {
    /// `"ok"`, or `"halted"` when a fatal bring-up step failed.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version from Cargo.toml.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Whether advertising has been requested.
    #[schema(example = true)]
    pub advertising: bool,

    /// Whether the GATT service is running.
    #[schema(example = true)]
    pub service_started: bool,
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "system",
    operation_id = "healthCheck",
    summary = "Check service health",
    description = "Returns service status and BLE bring-up progress. A `halted` status \
        means advertising or the GATT service failed to come up and the daemon must \
        be restarted.",
    responses(
        (status = 200, description = "Service is running", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let bring_up = state.bring_up();

    Json(HealthResponse {
        status: if bring_up.halted { "halted" } else { "ok" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        advertising: bring_up.advertising,
        service_started: bring_up.service_started,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum_test::TestServer;
    use irkfinder_core::{BondedDeviceStore, BringUpStatus, MemoryBondDatabase, Session};
    use tokio::sync::watch;

    use super::*;
    use crate::api::create_router;
    use crate::state::AppState;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            advertising: false,
            service_started: false,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"service_started\":false"));
    }

    #[tokio::test]
    async fn test_health_tracks_bring_up() {
        let session = Session::new(BondedDeviceStore::new(Arc::new(
            MemoryBondDatabase::default(),
        )));
        let (tx, rx) = watch::channel(BringUpStatus::default());
        let server = TestServer::new(create_router(AppState::new(session, rx))).unwrap();

        let before: HealthResponse = server.get("/health").await.json();
        assert_eq!(before.status, "ok");
        assert!(!before.advertising);

        tx.send_replace(BringUpStatus {
            advertising: true,
            service_started: true,
            halted: false,
        });
        let after: HealthResponse = server.get("/health").await.json();
        assert!(after.advertising);
        assert!(after.service_started);

        tx.send_replace(BringUpStatus {
            halted: true,
            ..BringUpStatus::default()
        });
        let halted: HealthResponse = server.get("/health").await.json();
        assert_eq!(halted.status, "halted");
    }
}
