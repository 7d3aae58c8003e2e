//! Shared types for the vxproto hub.
//!
//! This crate holds everything that crosses a crate boundary in the
//! workspace: the [`Packet`] envelope and its payload variants, the agent
//! type taxonomy, the protobuf and JSON wire encodings, the agent protocol
//! envelope used inside Data packets, and the handshake messages exchanged
//! before a channel is authenticated.
//!
//! No crate in the workspace depends on anything *except* `vxproto-types` for
//! cross-cutting type definitions.

pub mod error;
pub mod handshake;
pub mod json;
pub mod message;
pub mod packet;
pub mod wire;

pub use error::ProtoError;
pub use handshake::{AuthenticationRequest, AuthenticationResponse, AUTH_STATUS_AUTHORIZED};
pub use message::{AgentMessage, MessageType};
pub use packet::{
    Action, AckWaiter, Control, ControlMsgType, Data, File, Msg, MsgType, Packet, PacketType,
    Payload, Text, TraceContext,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the module every agent runs as its own dispatcher.
pub const MAIN_MODULE: &str = "main";

/// Kind of remote endpoint attached to the hub.
///
/// `VxAgent` and `VxServer` tokens are reproducible per agent ID, the other
/// kinds get a fresh random token on every handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentType {
    /// A regular endpoint agent.
    #[serde(rename = "VXAgent")]
    VxAgent,
    /// Another server (aggregation / multi-hop).
    #[serde(rename = "VXServer")]
    VxServer,
    /// A browser session.
    #[serde(rename = "Browser")]
    Browser,
    /// An external integration.
    #[serde(rename = "External")]
    External,
}

impl AgentType {
    /// Returns the canonical string label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VxAgent => "VXAgent",
            Self::VxServer => "VXServer",
            Self::Browser => "Browser",
            Self::External => "External",
        }
    }

    /// Numeric code stored in token flags.
    pub fn code(self) -> u8 {
        match self {
            Self::VxAgent => 1,
            Self::VxServer => 2,
            Self::Browser => 3,
            Self::External => 4,
        }
    }

    /// Attempts to convert a numeric code back to an `AgentType`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::VxAgent),
            2 => Some(Self::VxServer),
            3 => Some(Self::Browser),
            4 => Some(Self::External),
            _ => None,
        }
    }

    /// Maps the `{kind}` segment of `/api/{version}/vxpws/{kind}/{id}/`.
    pub fn from_connection_kind(kind: &str) -> Option<Self> {
        match kind {
            "agent" => Some(Self::VxAgent),
            "aggregate" => Some(Self::VxServer),
            "browser" => Some(Self::Browser),
            "external" => Some(Self::External),
            _ => None,
        }
    }

    /// Inverse of [`AgentType::from_connection_kind`].
    pub fn connection_kind(self) -> &'static str {
        match self {
            Self::VxAgent => "agent",
            Self::VxServer => "aggregate",
            Self::Browser => "browser",
            Self::External => "external",
        }
    }

    /// Whether tokens for this type are derived from the agent ID.
    pub fn has_deterministic_token(self) -> bool {
        matches!(self, Self::VxAgent | Self::VxServer)
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VXAgent" => Ok(Self::VxAgent),
            "VXServer" => Ok(Self::VxServer),
            "Browser" => Ok(Self::Browser),
            "External" => Ok(Self::External),
            other => Err(ProtoError::UnknownAgentType(other.to_string())),
        }
    }
}

/// Snapshot of a connected agent, attached to connect/disconnect control
/// packets so modules can track who is online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub agent_type: AgentType,
    pub group_id: String,
    pub ip: String,
    /// Connection token (the address modules use to reach the agent).
    pub token: String,
    pub version: String,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
