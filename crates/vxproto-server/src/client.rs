//! Agent-side connector.
//!
//! Opens a channel to a vxproto server and attaches it to a local hub, so
//! modules on the agent side address the server by the agent token exactly
//! like server modules address the agent.

use crate::api_ws::{AGENT_VERSION_HEADER, GROUP_HEADER};
use crate::transport::{FrameMode, WsTransport, FRAMING_FRAMED, FRAMING_HEADER};
use crate::ServerError;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{header, HeaderValue},
    Message,
};
use vxproto_hub::{AgentSocket, ChaChaEncryptor, IntervalPinger, VxProto};
use vxproto_policy::ConnectionPolicy;
use vxproto_types::{AgentInfo, AgentType, AuthenticationRequest, AuthenticationResponse};

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct AgentConnector {
    /// Server base URL, e.g. `ws://127.0.0.1:8443`.
    pub base_url: String,
    /// API version segment, e.g. `v1`.
    pub version: String,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub agent_version: String,
    pub group_id: Option<String>,
    /// Shared tunnel secret; must match the server's token secret.
    pub tunnel_key: Option<Vec<u8>>,
    pub write_timeout: Duration,
    pub ping_interval: Option<Duration>,
}

impl AgentConnector {
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            version: "v1".to_string(),
            agent_id: agent_id.into(),
            agent_type: AgentType::VxAgent,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            group_id: None,
            tunnel_key: None,
            write_timeout: Duration::from_secs(10),
            ping_interval: None,
        }
    }

    fn handshake_url(&self) -> String {
        format!("{}/api/{}/vxpws/agent/", self.base_url, self.version)
    }

    fn channel_url(&self) -> String {
        format!(
            "{}/api/{}/vxpws/{}/{}/",
            self.base_url,
            self.version,
            self.agent_type.connection_kind(),
            self.agent_id
        )
    }
}

/// A live agent-side channel registered in a hub.
pub struct AgentConnection {
    /// Token addressing the server from this hub.
    pub token: String,
    /// Server token received in the handshake.
    pub stoken: String,
    pub socket: Arc<AgentSocket>,
    task: JoinHandle<()>,
}

impl AgentConnection {
    /// Whether the channel's run loop has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Closes the channel and waits for it to leave the hub.
    pub async fn close(self) {
        self.socket.close().await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "agent channel task failed");
        }
    }
}

fn ws_error(e: tungstenite::Error) -> ServerError {
    match e {
        tungstenite::Error::Http(response) => ServerError::HttpStatus(response.status().as_u16()),
        other => ServerError::WebSocket(other.to_string()),
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ServerError> {
    HeaderValue::from_str(value).map_err(|e| ServerError::Handshake(e.to_string()))
}

/// Runs the token handshake and returns the server's answer.
pub async fn handshake(connector: &AgentConnector) -> Result<AuthenticationResponse, ServerError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(connector.handshake_url())
        .await
        .map_err(ws_error)?;

    let request = AuthenticationRequest {
        timestamp: vxproto_types::now_millis(),
        agent_id: connector.agent_id.clone(),
        agent_type: connector.agent_type.to_string(),
        version: connector.agent_version.clone(),
    };
    ws.send(Message::Binary(request.to_bytes().into()))
        .await
        .map_err(ws_error)?;

    let response = loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => break AuthenticationResponse::parse(&data)?,
            Some(Ok(Message::Close(_))) | None => {
                return Err(ServerError::Handshake(
                    "connection closed before response".to_string(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ws_error(e)),
        }
    };
    let _ = ws.close(None).await;

    if !response.is_authorized() {
        return Err(ServerError::Rejected(response.status));
    }
    Ok(response)
}

/// Authenticates against a server and attaches the channel to `hub`.
///
/// The channel is registered under the issued agent token, so local modules
/// reach the server with `dst = connection.token`.
pub async fn connect_agent(
    hub: &VxProto,
    connector: &AgentConnector,
) -> Result<AgentConnection, ServerError> {
    let auth = handshake(connector).await?;

    let mut request = connector
        .channel_url()
        .into_client_request()
        .map_err(ws_error)?;
    let headers = request.headers_mut();
    headers.insert(
        header::AUTHORIZATION,
        header_value(&format!("Bearer {}", auth.atoken))?,
    );
    headers.insert(FRAMING_HEADER, HeaderValue::from_static(FRAMING_FRAMED));
    headers.insert(AGENT_VERSION_HEADER, header_value(&connector.agent_version)?);
    if let Some(group) = &connector.group_id {
        headers.insert(GROUP_HEADER, header_value(group)?);
    }

    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(ws_error)?;
    let transport = Arc::new(WsTransport::new(
        ws,
        connector.write_timeout,
        Some(FrameMode::Framed),
    ));

    let info = AgentInfo {
        id: connector.agent_id.clone(),
        agent_type: AgentType::VxServer,
        group_id: connector.group_id.clone().unwrap_or_default(),
        ip: String::new(),
        token: auth.atoken.clone(),
        version: auth.server_version.clone(),
    };
    let mut socket = AgentSocket::new(info, auth.atoken.clone(), ConnectionPolicy::Allow, transport);
    if let Some(key) = &connector.tunnel_key {
        let tunnel = ChaChaEncryptor::derive(key, &auth.atoken, &auth.stoken)
            .map_err(vxproto_hub::HubError::from)?;
        socket = socket.with_encryptor(Arc::new(tunnel));
    }
    if let Some(interval) = connector.ping_interval {
        socket = socket.with_pinger(Arc::new(IntervalPinger::new(interval)));
    }
    let socket = Arc::new(socket);
    hub.add_agent(Arc::clone(&socket))?;

    let task = {
        let hub = hub.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            if let Err(e) = socket.run(&hub).await {
                tracing::debug!(token = %socket.token(), error = %e, "server channel ended");
            }
            if let Err(e) = hub.del_agent(socket.token()) {
                tracing::debug!(error = %e, "server channel already removed");
            }
        })
    };

    tracing::info!(
        agent_id = %connector.agent_id,
        server_version = %auth.server_version,
        encrypted = connector.tunnel_key.is_some(),
        "connected to server"
    );
    Ok(AgentConnection {
        token: auth.atoken,
        stoken: auth.stoken,
        socket,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_the_endpoint_layout() {
        let mut connector = AgentConnector::new("ws://127.0.0.1:8443/", "agent-7");
        assert_eq!(
            connector.handshake_url(),
            "ws://127.0.0.1:8443/api/v1/vxpws/agent/"
        );
        assert_eq!(
            connector.channel_url(),
            "ws://127.0.0.1:8443/api/v1/vxpws/agent/agent-7/"
        );

        connector.agent_type = AgentType::Browser;
        connector.version = "v2".to_string();
        assert_eq!(
            connector.channel_url(),
            "ws://127.0.0.1:8443/api/v2/vxpws/browser/agent-7/"
        );
    }
}
