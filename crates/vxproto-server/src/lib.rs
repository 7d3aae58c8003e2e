//! vxproto server library.
//!
//! Serves the agent endpoints of a [`VxProto`] hub over axum websockets:
//!
//! - `GET /api/{version}/vxpws/agent/`: token handshake
//! - `GET /api/{version}/vxpws/{kind}/{id}/`: authenticated packet channel
//! - `GET /health`

pub mod api_ws;
pub mod client;
pub mod config;
pub mod transport;
pub mod validator;

use axum::{extract::Extension, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use vxproto_hub::{HubError, LoggingApp, TransportError, VxProto};
use vxproto_policy::{PolicyError, PolicyTable};
use vxproto_token::{TokenCipher, TokenError};
use vxproto_types::{AgentType, ProtoError};

use crate::config::Config;
use crate::validator::{ConnectionValidator, DefaultValidator};

/// Errors raised while serving or opening agent channels.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The handshake request was missing or malformed.
    #[error("bad handshake: {0}")]
    Handshake(String),

    /// The presented token is missing or invalid.
    #[error("unauthorized")]
    Unauthorized,

    /// The application or connection validator refused the agent.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The server answered the handshake without authorizing.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The server refused the websocket upgrade with this status.
    #[error("server answered {0}")]
    HttpStatus(u16),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ServerError {
    /// HTTP status used when the error rejects a request.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Handshake(_) | Self::Proto(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::Rejected(_) => StatusCode::FORBIDDEN,
            Self::Policy(PolicyError::UnknownEndpoint(_)) => StatusCode::NOT_FOUND,
            Self::Policy(_) => StatusCode::FORBIDDEN,
            Self::HttpStatus(code) => {
                StatusCode::from_u16(*code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub hub: VxProto,
    pub policies: PolicyTable,
    pub server_id: String,
    /// Server token handed to every agent in the handshake.
    pub stoken: String,
    pub validator: Arc<dyn ConnectionValidator>,
    pub write_timeout: Duration,
}

impl AppState {
    pub fn new(
        hub: VxProto,
        policies: PolicyTable,
        server_id: impl Into<String>,
        validator: Arc<dyn ConnectionValidator>,
        write_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let server_id = server_id.into();
        let stoken = hub.cipher().new_token(&server_id, AgentType::VxServer)?;
        Ok(Self {
            hub,
            policies,
            server_id,
            stoken,
            validator,
            write_timeout,
        })
    }

    /// Builds the hub and handler state described by a configuration.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let (cipher, tunnel_key) = match &config.token.secret {
            Some(secret) => {
                let key = hex::decode(secret.trim())
                    .map_err(|e| TokenError::InvalidSecret(e.to_string()))?;
                (TokenCipher::from_hex(secret)?, Some(key))
            }
            None => {
                tracing::warn!("no token secret configured, tokens will not survive a restart");
                (TokenCipher::generate(), None)
            }
        };

        let tunnel_key = match (config.transport.tunnel_encryption, tunnel_key) {
            (true, Some(key)) => Some(key),
            (true, None) => {
                tracing::warn!("tunnel encryption needs token.secret, disabling it");
                None
            }
            (false, _) => None,
        };

        let hub = VxProto::new(Arc::new(LoggingApp), cipher, config.hub.to_hub_config());
        let validator = DefaultValidator::new(tunnel_key, config.transport.ping_interval());
        Self::new(
            hub,
            PolicyTable::new(&config.endpoints),
            config.server.server_id.clone(),
            Arc::new(validator),
            config.transport.write_timeout(),
        )
    }
}

/// Health check handler.
///
/// Returns `200 OK` with the server version and live registry counts.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": if state.hub.is_closed() { "closing" } else { "ok" },
        "version": state.hub.app().version(),
        "agents": state.hub.agent_count(),
        "modules": state.hub.module_count(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/{version}/vxpws/{kind}/", get(api_ws::handshake_handler))
        .route("/api/{version}/vxpws/{kind}/{id}/", get(api_ws::channel_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_registry_counts() {
        let config = Config::default();
        let state = Arc::new(AppState::from_config(&config).unwrap());
        let module = state.hub.new_module("scanner", "");
        state.hub.add_module(&module).unwrap();

        let response = app(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["agents"], 0);
        assert_eq!(json["modules"], 1);
    }

    #[tokio::test]
    async fn bad_secret_is_a_config_error() {
        let mut config = Config::default();
        config.token.secret = Some("not hex".to_string());
        assert!(matches!(
            AppState::from_config(&config),
            Err(ServerError::Token(TokenError::InvalidSecret(_)))
        ));
    }

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(ServerError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ServerError::Policy(PolicyError::Blocked).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServerError::Policy(PolicyError::UnknownEndpoint("v9".into())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
