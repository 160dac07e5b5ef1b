// Module: http
// Health/statistics endpoints and the two signaling sockets

pub mod error;
pub mod health;
pub mod relay;
pub mod websocket;

use axum::{routing::get, Router};
use metaverse_sfu::{RelayHub, SfuManager};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{AuthError, Claims, JwtVerifier};

pub use error::{AppError, AppResult};

/// Largest signaling frame accepted from a client
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SfuManager>,
    pub relay: Arc<RelayHub>,
    /// None when the sockets accept anonymous clients
    pub verifier: Option<Arc<JwtVerifier>>,
}

impl AppState {
    #[must_use]
    pub fn new(manager: Arc<SfuManager>, relay: Arc<RelayHub>, jwt_secret: Option<&str>) -> Self {
        Self {
            manager,
            relay,
            verifier: jwt_secret.map(|secret| Arc::new(JwtVerifier::new(secret))),
        }
    }

    /// Check the `token` query parameter of a socket upgrade
    pub fn authorize(&self, token: Option<&str>) -> AppResult<Option<Claims>> {
        let Some(verifier) = &self.verifier else {
            return Ok(None);
        };
        let token = token.ok_or(AuthError::MissingToken)?;
        Ok(Some(verifier.verify(token)?))
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .route("/ws", get(websocket::websocket_handler))
        .route("/ws/p2p", get(relay::relay_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
