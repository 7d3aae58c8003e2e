//! Websocket endpoints: the token handshake and the authenticated channel.

use crate::transport::{FrameMode, WsTransport, FRAMING_FRAMED, FRAMING_HEADER};
use crate::validator::{ConnectContext, ConnectHooks};
use crate::{AppState, ServerError};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Extension, Path, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use vxproto_hub::AgentSocket;
use vxproto_policy::ConnectionPolicy;
use vxproto_types::{
    AgentInfo, AgentType, AuthenticationRequest, AuthenticationResponse, AUTH_STATUS_AUTHORIZED,
};

/// Time an agent gets to send its authentication request.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Request header carrying the initial group of a channel.
pub const GROUP_HEADER: &str = "x-vxp-group";
/// Request header carrying the agent software version.
pub const AGENT_VERSION_HEADER: &str = "x-vxp-agent-version";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Extracts the token from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, header::AUTHORIZATION.as_str())?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Path segment of the handshake endpoint.
pub const HANDSHAKE_KIND: &str = "agent";

/// `GET /api/{version}/vxpws/agent/`
pub async fn handshake_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(state): Extension<Arc<AppState>>,
    Path((version, kind)): Path<(String, String)>,
) -> impl IntoResponse {
    if kind != HANDSHAKE_KIND {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.policies.get(&version) {
        None => {
            tracing::debug!(remote_addr = %addr, version = %version, "handshake on unknown endpoint");
            StatusCode::NOT_FOUND.into_response()
        }
        Some(ConnectionPolicy::Block) => {
            tracing::warn!(remote_addr = %addr, version = %version, "handshake on blocked endpoint");
            StatusCode::FORBIDDEN.into_response()
        }
        Some(_) => ws.on_upgrade(move |socket| handle_handshake(socket, state, version, addr)),
    }
}

async fn read_request(socket: &mut WebSocket) -> Result<AuthenticationRequest, ServerError> {
    let read = async {
        while let Some(message) = socket.recv().await {
            match message.map_err(|e| ServerError::WebSocket(e.to_string()))? {
                Message::Binary(data) => return Ok(AuthenticationRequest::parse(&data)?),
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(ServerError::Handshake("connection closed before request".to_string()))
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, read)
        .await
        .map_err(|_| ServerError::Handshake("request timed out".to_string()))?
}

/// Issues the token pair for an authentication request.
fn authorize(
    state: &AppState,
    version: &str,
    request: &AuthenticationRequest,
    addr: SocketAddr,
) -> Result<String, ServerError> {
    let agent_type: AgentType = request.agent_type.parse()?;
    state.policies.resolve(version, agent_type)?;

    let token = state.hub.cipher().new_token(&request.agent_id, agent_type)?;
    let info = AgentInfo {
        id: request.agent_id.clone(),
        agent_type,
        group_id: String::new(),
        ip: addr.ip().to_string(),
        token: token.clone(),
        version: request.version.clone(),
    };
    state
        .hub
        .app()
        .validate_agent_info(&info)
        .map_err(ServerError::Forbidden)?;
    Ok(token)
}

async fn handle_handshake(
    mut socket: WebSocket,
    state: Arc<AppState>,
    version: String,
    addr: SocketAddr,
) {
    let request = match read_request(&mut socket).await {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(remote_addr = %addr, error = %e, "handshake failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let mut response = AuthenticationResponse {
        server_version: state.hub.app().version(),
        ..AuthenticationResponse::default()
    };
    match authorize(&state, &version, &request, addr) {
        Ok(atoken) => {
            tracing::info!(
                remote_addr = %addr,
                agent_id = %request.agent_id,
                agent_type = %request.agent_type,
                "agent authorized"
            );
            response.atoken = atoken;
            response.stoken = state.stoken.clone();
            response.status = AUTH_STATUS_AUTHORIZED.to_string();
        }
        Err(e) => {
            tracing::warn!(
                remote_addr = %addr,
                agent_id = %request.agent_id,
                error = %e,
                "agent not authorized"
            );
            response.status = e.to_string();
        }
    }

    if let Err(e) = socket.send(Message::Binary(response.to_bytes().into())).await {
        tracing::warn!(remote_addr = %addr, error = %e, "failed to send handshake response");
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Everything checked about a channel request before the upgrade.
struct Admission {
    info: AgentInfo,
    policy: ConnectionPolicy,
    mode: Option<FrameMode>,
}

fn admit(
    state: &AppState,
    version: &str,
    kind: &str,
    id: &str,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> Result<(Admission, ConnectHooks), StatusCode> {
    let agent_type = AgentType::from_connection_kind(kind).ok_or(StatusCode::NOT_FOUND)?;
    let policy = state
        .policies
        .resolve(version, agent_type)
        .map_err(|e| ServerError::from(e).status())?;

    let Some(token) = bearer_token(headers) else {
        tracing::warn!(remote_addr = %addr, agent_id = %id, "channel request without token");
        return Err(StatusCode::UNAUTHORIZED);
    };
    if !state.hub.cipher().has_token_valid(token, id, agent_type) {
        tracing::warn!(remote_addr = %addr, agent_id = %id, "channel request with invalid token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let info = AgentInfo {
        id: id.to_string(),
        agent_type,
        group_id: header_str(headers, GROUP_HEADER).unwrap_or_default().to_string(),
        ip: addr.ip().to_string(),
        token: token.to_string(),
        version: header_str(headers, AGENT_VERSION_HEADER)
            .unwrap_or_default()
            .to_string(),
    };

    let ctx = ConnectContext {
        info: &info,
        remote: addr,
        stoken: &state.stoken,
        headers,
    };
    let hooks = state.validator.validate(&ctx).map_err(|reason| {
        tracing::warn!(remote_addr = %addr, agent_id = %id, reason = %reason, "connection refused");
        StatusCode::FORBIDDEN
    })?;

    let mode = match header_str(headers, FRAMING_HEADER) {
        Some(value) if value.eq_ignore_ascii_case(FRAMING_FRAMED) => Some(FrameMode::Framed),
        _ => None,
    };

    Ok((Admission { info, policy, mode }, hooks))
}

/// `GET /api/{version}/vxpws/{kind}/{id}/`
pub async fn channel_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(state): Extension<Arc<AppState>>,
    Path((version, kind, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    match admit(&state, &version, &kind, &id, &headers, addr) {
        Ok((admission, hooks)) => {
            ws.on_upgrade(move |socket| serve_channel(socket, state, admission, hooks))
        }
        Err(status) => status.into_response(),
    }
}

async fn serve_channel(
    socket: WebSocket,
    state: Arc<AppState>,
    admission: Admission,
    hooks: ConnectHooks,
) {
    let Admission { info, policy, mode } = admission;
    let transport = Arc::new(WsTransport::new(socket, state.write_timeout, mode));

    let mut agent = AgentSocket::new(info, state.stoken.clone(), policy, transport)
        .with_encryptor(hooks.encryptor);
    if let Some(pinger) = hooks.pinger {
        agent = agent.with_pinger(pinger);
    }
    let agent = Arc::new(agent);
    let token = agent.token().to_string();

    if let Err(e) = state.hub.add_agent(Arc::clone(&agent)) {
        tracing::warn!(agent_id = %agent.id(), error = %e, "agent registration failed");
        agent.close().await;
        return;
    }
    tracing::info!(
        agent_id = %agent.id(),
        agent_type = %agent.agent_type(),
        group_id = %agent.group_id(),
        "agent connected"
    );

    let closing = Arc::clone(&agent);
    let closer = state.hub.add_closer(move || async move { closing.close().await });

    if let Err(e) = agent.run(&state.hub).await {
        tracing::debug!(agent_id = %agent.id(), error = %e, "agent connection ended");
    }

    state.hub.remove_closer(closer);
    if let Err(e) = state.hub.del_agent(&token) {
        tracing::debug!(agent_id = %agent.id(), error = %e, "agent already removed");
    }
    agent.close().await;
    tracing::info!(agent_id = %agent.id(), "agent disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer 0a1b"));
        assert_eq!(bearer_token(&headers), Some("0a1b"));
    }
}
