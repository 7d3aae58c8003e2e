//! Per-connection hooks applied when an agent channel is accepted.

use axum::http::HeaderMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use vxproto_hub::{ChaChaEncryptor, IntervalPinger, PackEncryptor, Pinger, PlainEncryptor};
use vxproto_types::AgentInfo;

/// What the validator knows about a connection being accepted.
#[derive(Debug)]
pub struct ConnectContext<'a> {
    pub info: &'a AgentInfo,
    pub remote: SocketAddr,
    /// Server token the agent was issued alongside its own.
    pub stoken: &'a str,
    pub headers: &'a HeaderMap,
}

/// Tunnel encryptor and pinger chosen for one connection.
pub struct ConnectHooks {
    pub encryptor: Arc<dyn PackEncryptor>,
    pub pinger: Option<Arc<dyn Pinger>>,
}

impl Default for ConnectHooks {
    fn default() -> Self {
        Self {
            encryptor: Arc::new(PlainEncryptor),
            pinger: None,
        }
    }
}

/// Accepts or refuses authenticated connections and builds their hooks.
///
/// Runs before the websocket upgrade; a refusal becomes `403 Forbidden`.
pub trait ConnectionValidator: Send + Sync + 'static {
    fn validate(&self, ctx: &ConnectContext<'_>) -> Result<ConnectHooks, String>;
}

/// Accepts every connection, optionally adding tunnel encryption and
/// liveness pings.
#[derive(Debug, Clone, Default)]
pub struct DefaultValidator {
    tunnel_key: Option<Vec<u8>>,
    ping_interval: Option<Duration>,
}

impl DefaultValidator {
    pub fn new(tunnel_key: Option<Vec<u8>>, ping_interval: Option<Duration>) -> Self {
        Self {
            tunnel_key,
            ping_interval,
        }
    }
}

impl ConnectionValidator for DefaultValidator {
    fn validate(&self, ctx: &ConnectContext<'_>) -> Result<ConnectHooks, String> {
        let mut hooks = ConnectHooks::default();
        if let Some(key) = &self.tunnel_key {
            let tunnel = ChaChaEncryptor::derive(key, &ctx.info.token, ctx.stoken)
                .map_err(|e| e.to_string())?;
            hooks.encryptor = Arc::new(tunnel);
        }
        if let Some(interval) = self.ping_interval {
            hooks.pinger = Some(Arc::new(IntervalPinger::new(interval)));
        }
        tracing::debug!(
            agent_id = %ctx.info.id,
            remote_addr = %ctx.remote,
            encrypted = self.tunnel_key.is_some(),
            "connection hooks prepared"
        );
        Ok(hooks)
    }
}
