//! One live remote connection.

use crate::crypto::{PackEncryptor, PlainEncryptor};
use crate::error::HubError;
use crate::hub::VxProto;
use crate::pinger::Pinger;
use crate::transport::{Inbound, Transport};
use std::sync::{Arc, RwLock};
use vxproto_policy::ConnectionPolicy;
use vxproto_types::{wire, AgentInfo, AgentType, Packet};

/// A connected agent (or server, browser, external client).
///
/// `token` addresses the connection inside the hub; both ends of a channel
/// register it under the same token. `local_token` identifies this side to
/// the peer and is stamped as the source of outgoing packets that have none.
pub struct AgentSocket {
    id: String,
    agent_type: AgentType,
    ip: String,
    version: String,
    token: String,
    local_token: String,
    group_id: RwLock<String>,
    policy: ConnectionPolicy,
    transport: Arc<dyn Transport>,
    encryptor: Arc<dyn PackEncryptor>,
    pinger: Option<Arc<dyn Pinger>>,
}

impl std::fmt::Debug for AgentSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSocket")
            .field("id", &self.id)
            .field("agent_type", &self.agent_type)
            .field("token", &self.token)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AgentSocket {
    pub fn new(
        info: AgentInfo,
        local_token: impl Into<String>,
        policy: ConnectionPolicy,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: info.id,
            agent_type: info.agent_type,
            ip: info.ip,
            version: info.version,
            token: info.token,
            local_token: local_token.into(),
            group_id: RwLock::new(info.group_id),
            policy,
            transport,
            encryptor: Arc::new(PlainEncryptor),
            pinger: None,
        }
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn PackEncryptor>) -> Self {
        self.encryptor = encryptor;
        self
    }

    pub fn with_pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pinger = Some(pinger);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn local_token(&self) -> &str {
        &self.local_token
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    pub fn group_id(&self) -> String {
        self.group_id
            .read()
            .unwrap_or_else(|poisoned| {
                tracing::error!("agent group lock poisoned, recovering");
                poisoned.into_inner()
            })
            .clone()
    }

    pub(crate) fn set_group_id(&self, group_id: &str) {
        let mut guard = self.group_id.write().unwrap_or_else(|poisoned| {
            tracing::error!("agent group lock poisoned, recovering");
            poisoned.into_inner()
        });
        *guard = group_id.to_string();
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id.clone(),
            agent_type: self.agent_type,
            group_id: self.group_id(),
            ip: self.ip.clone(),
            token: self.token.clone(),
            version: self.version.clone(),
        }
    }

    /// Encodes, encrypts and writes a packet, then acknowledges it.
    pub async fn send_packet(&self, mut packet: Packet) -> Result<(), HubError> {
        let encoded = wire::encode(&packet)?;
        let sealed = self.encryptor.encrypt(&encoded)?;
        self.transport.write(&sealed).await?;
        tracing::trace!(token = %self.token, dst = %packet.dst, "packet written");
        packet.set_ack();
        Ok(())
    }

    /// Reads the next packet. Pongs are handed to the pinger on the way.
    /// `Ok(None)` means the connection closed.
    pub async fn read_packet(&self) -> Result<Option<Packet>, HubError> {
        loop {
            match self.transport.read().await? {
                None => return Ok(None),
                Some(Inbound::Pong(payload)) => {
                    if let Some(pinger) = &self.pinger {
                        pinger.process(&payload).await;
                    }
                }
                Some(Inbound::Packet(raw)) => {
                    let plain = self.encryptor.decrypt(&raw)?;
                    return Ok(Some(wire::decode(&plain)?));
                }
            }
        }
    }

    /// Pumps packets from the connection into the hub until it closes.
    ///
    /// Undecodable packets and packets refused by the hub are logged and
    /// skipped; transport failures end the loop.
    pub async fn run(&self, hub: &VxProto) -> Result<(), HubError> {
        if let Some(pinger) = &self.pinger {
            pinger.start(Arc::clone(&self.transport)).await;
        }

        let result = loop {
            match self.read_packet().await {
                Ok(Some(mut packet)) => {
                    if packet.dst.is_empty() {
                        packet.dst = self.token.clone();
                    }
                    match hub.recv_packet(packet).await {
                        Ok(()) => {}
                        Err(HubError::Closed) => break Ok(()),
                        Err(e) => {
                            tracing::warn!(token = %self.token, error = %e, "inbound packet rejected");
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(e @ (HubError::Proto(_) | HubError::Crypto(_))) => {
                    tracing::warn!(token = %self.token, error = %e, "dropping unreadable packet");
                }
                Err(e) => break Err(e),
            }
        };

        if let Some(pinger) = &self.pinger {
            pinger.stop().await;
        }
        result
    }

    /// Stops liveness probing and closes the transport.
    pub async fn close(&self) {
        if let Some(pinger) = &self.pinger {
            pinger.stop().await;
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(token = %self.token, error = %e, "transport close failed");
        }
    }
}
