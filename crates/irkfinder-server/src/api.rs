//! HTTP API routes and handlers.
//!
//! - `health` - Service health and bring-up status
//! - `irk` - Captured identity key and reset
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod error;
pub mod health;
pub mod irk;
pub mod openapi;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Every documented route, with its OpenAPI paths attached.
pub fn api_router() -> OpenApiRouter<SharedState> {
    OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .routes(routes!(health::health_check))
        .routes(routes!(irk::get_status))
        .routes(routes!(irk::reset))
}

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health and bring-up status
/// /api
/// ├── /status            - Captured identity key
/// ├── /reset             - Forget the key and all bonds
/// └── /openapi.json      - OpenAPI specification
/// /swagger-ui            - Interactive API docs
/// ```
pub fn create_router(state: SharedState) -> Router {
    let (router, openapi) = api_router().split_for_parts();

    router
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", openapi))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
