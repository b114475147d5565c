//! OpenAPI specification for the irkfinder API.
//!
//! [`ApiDoc`] carries the document metadata and shared schemas; the paths
//! are collected from the handlers as they are routed in [`super::api_router`].
//! The document is served at `/api/openapi.json` with Swagger UI at
//! `/swagger-ui`, and written to disk by the `gen-openapi` binary.

use utoipa::OpenApi;

use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::irk::{IrkStatusResponse, ResetResponse};

/// The complete OpenAPI document, paths included.
pub fn openapi() -> utoipa::openapi::OpenApi {
    super::api_router().split_for_parts().1
}

/// Returns the OpenAPI specification as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    openapi().to_pretty_json()
}

/// Document metadata for irkfinder.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "irkfinder API",
        version = "0.1.0",
        description = r#"
# irkfinder API

irkfinder pairs with your phone over Bluetooth Low Energy and hands you the
phone's Identity Resolving Key (IRK), so presence-detection tools can follow
the phone through its rotating private addresses.

## Usage

1. Open Bluetooth settings on the phone and pair with the advertised device.
2. Poll `GET /api/status` until `irk_retrieved` is true.
3. Copy the encoding your tool expects:
   - `irk_reversed` for ESPresense
   - `irk_base64` for Home Assistant's Private BLE Device integration
   - `irk` or `irk_array` for everything else
4. `POST /api/reset` to forget the key and all bonds before pairing another phone.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local irkfinder server")
    ),
    tags(
        (
            name = "system",
            description = "Health checks and bring-up status"
        ),
        (
            name = "irk",
            description = "Captured identity key and reset"
        )
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            IrkStatusResponse,
            ResetResponse,
            irkfinder_core::CaptureSource,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = openapi();
        assert_eq!(spec.info.title, "irkfinder API");
        for path in ["/health", "/api/status", "/api/reset"] {
            assert!(spec.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"irkfinder API\""));
        assert!(json.contains("IrkStatusResponse"));
    }

    #[test]
    fn test_encoding_descriptions_name_their_consumers() {
        let doc: serde_json::Value = serde_json::from_str(&get_openapi_json().unwrap()).unwrap();
        let props = &doc["components"]["schemas"]["IrkStatusResponse"]["properties"];
        let reversed = props["irk_reversed"]["description"].as_str().unwrap();
        let base64 = props["irk_base64"]["description"].as_str().unwrap();
        assert!(reversed.contains("ESPresense"));
        assert!(base64.contains("Home Assistant"));

        let usage = doc["info"]["description"].as_str().unwrap();
        assert!(usage.contains("`irk_reversed` for ESPresense"));
        assert!(usage.contains("`irk_base64` for Home Assistant"));
    }
}
