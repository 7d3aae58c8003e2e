//! Connection policies for agent channels.
//!
//! Each API version endpoint carries one [`ConnectionPolicy`]. The policy is
//! resolved when a connection is accepted, latched onto the agent socket and
//! then evaluated for every packet crossing that connection in either
//! direction.
//!
//! - `Allow` places no restriction.
//! - `Block` refuses the upgrade itself and every packet.
//! - `Upgrade` keeps a maintenance channel open to an agent that is being
//!   upgraded: only `VXAgent` connections, only the `main` module, and only
//!   the upgrade push / push-result exchange plus upgrader artifacts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use vxproto_types::{AgentMessage, AgentType, MessageType, Packet, PacketType, Payload, MAIN_MODULE};

/// Direction of a packet relative to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the remote connection into the hub.
    Inbound,
    /// From the hub out to the remote connection.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// Reasons a connection or packet is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The endpoint is blocked entirely.
    #[error("connection blocked by policy")]
    Blocked,

    /// No policy is configured for the requested API version.
    #[error("unknown endpoint version: {0}")]
    UnknownEndpoint(String),

    /// The agent type may not connect to this endpoint.
    #[error("agent type {0} is not admitted on this endpoint")]
    AgentTypeForbidden(AgentType),

    /// The packet addresses a module other than the ones admitted.
    #[error("module {0} is not reachable on this connection")]
    ModuleForbidden(String),

    /// The packet type may not cross the connection in this direction.
    #[error("{direction} {ptype} packets are not admitted on this connection")]
    PacketTypeForbidden {
        direction: Direction,
        ptype: PacketType,
    },

    /// The embedded agent message type is not admitted.
    #[error("{direction} message type {name} is not admitted on this connection")]
    MessageTypeForbidden { direction: Direction, name: String },

    /// A file sent on an upgrade channel is not an upgrader artifact.
    #[error("file {0} is not an upgrader artifact")]
    NotUpgraderFile(String),

    /// A Data payload could not be decoded as an agent message.
    #[error("malformed agent message: {0}")]
    MalformedMessage(String),
}

/// Rule set governing one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPolicy {
    #[default]
    Allow,
    Block,
    Upgrade,
}

impl ConnectionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::Upgrade => "upgrade",
        }
    }

    /// Checks whether a connection of `agent_type` may be accepted.
    pub fn check_connect(self, agent_type: AgentType) -> Result<(), PolicyError> {
        match self {
            Self::Allow => Ok(()),
            Self::Block => Err(PolicyError::Blocked),
            Self::Upgrade if agent_type == AgentType::VxAgent => Ok(()),
            Self::Upgrade => Err(PolicyError::AgentTypeForbidden(agent_type)),
        }
    }

    /// Checks a packet received from the remote side.
    pub fn check_inbound(self, packet: &Packet) -> Result<(), PolicyError> {
        self.check(Direction::Inbound, packet)
    }

    /// Checks a packet about to be written to the remote side.
    pub fn check_outbound(self, packet: &Packet) -> Result<(), PolicyError> {
        self.check(Direction::Outbound, packet)
    }

    fn check(self, direction: Direction, packet: &Packet) -> Result<(), PolicyError> {
        match self {
            Self::Allow => Ok(()),
            Self::Block => Err(PolicyError::Blocked),
            Self::Upgrade => check_upgrade(direction, packet),
        }
    }
}

fn check_upgrade(direction: Direction, packet: &Packet) -> Result<(), PolicyError> {
    if packet.module != MAIN_MODULE {
        return Err(PolicyError::ModuleForbidden(packet.module.clone()));
    }

    match (&packet.payload, direction) {
        (Payload::Data(data), Direction::Inbound) => {
            expect_message(direction, &data.data, MessageType::AgentUpgradeExecPushResult)
        }
        (Payload::Data(data), Direction::Outbound) => {
            expect_message(direction, &data.data, MessageType::AgentUpgradeExecPush)
        }
        (Payload::File(file), Direction::Outbound) => {
            if file.upgrader {
                Ok(())
            } else {
                Err(PolicyError::NotUpgraderFile(file.name.clone()))
            }
        }
        // Agents keep reporting their upgrade progress as log messages.
        (Payload::Msg(_), Direction::Inbound) => Ok(()),
        (payload, direction) => Err(PolicyError::PacketTypeForbidden {
            direction,
            ptype: payload.packet_type(),
        }),
    }
}

fn expect_message(direction: Direction, data: &[u8], expected: MessageType) -> Result<(), PolicyError> {
    let message =
        AgentMessage::parse(data).map_err(|e| PolicyError::MalformedMessage(e.to_string()))?;
    match message.message_type() {
        Some(t) if t == expected => Ok(()),
        Some(t) => Err(PolicyError::MessageTypeForbidden {
            direction,
            name: t.as_str().to_string(),
        }),
        None => Err(PolicyError::MessageTypeForbidden {
            direction,
            name: message.r#type.to_string(),
        }),
    }
}

/// One `{ version, policy }` entry of the endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// API version segment, e.g. `"v1"`.
    pub version: String,
    #[serde(default)]
    pub policy: ConnectionPolicy,
}

/// Policies of every served API version.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    endpoints: HashMap<String, ConnectionPolicy>,
}

impl PolicyTable {
    pub fn new(endpoints: &[EndpointPolicy]) -> Self {
        Self {
            endpoints: endpoints
                .iter()
                .map(|e| (e.version.clone(), e.policy))
                .collect(),
        }
    }

    /// The policy of an endpoint, if the version is served.
    pub fn get(&self, version: &str) -> Option<ConnectionPolicy> {
        self.endpoints.get(version).copied()
    }

    /// Resolves the policy for a new connection and checks the agent type is
    /// admitted.
    pub fn resolve(&self, version: &str, agent_type: AgentType) -> Result<ConnectionPolicy, PolicyError> {
        let policy = self
            .get(version)
            .ok_or_else(|| PolicyError::UnknownEndpoint(version.to_string()))?;
        policy.check_connect(agent_type)?;
        tracing::debug!(version, policy = policy.as_str(), agent_type = %agent_type, "resolved connection policy");
        Ok(policy)
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}
