//! Messages exchanged on the pre-authentication endpoint.
//!
//! The agent opens `/api/{version}/vxpws/agent/`, sends one
//! [`AuthenticationRequest`] and receives one [`AuthenticationResponse`]
//! carrying the tokens for the authenticated channel.

use crate::ProtoError;
use prost::Message;

/// Status value of a successful handshake.
pub const AUTH_STATUS_AUTHORIZED: &str = "authorized";

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthenticationRequest {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(string, tag = "2")]
    pub agent_id: String,
    /// Agent type label, e.g. `"VXAgent"`.
    #[prost(string, tag = "3")]
    pub agent_type: String,
    #[prost(string, tag = "4")]
    pub version: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthenticationResponse {
    /// Token the agent presents on the authenticated channel.
    #[prost(string, tag = "1")]
    pub atoken: String,
    /// Token identifying the server to the agent.
    #[prost(string, tag = "2")]
    pub stoken: String,
    #[prost(string, tag = "3")]
    pub server_version: String,
    #[prost(string, tag = "4")]
    pub status: String,
}

impl AuthenticationRequest {
    pub fn parse(data: &[u8]) -> Result<Self, ProtoError> {
        Ok(Self::decode(data)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

impl AuthenticationResponse {
    pub fn parse(data: &[u8]) -> Result<Self, ProtoError> {
        Ok(Self::decode(data)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn is_authorized(&self) -> bool {
        self.status == AUTH_STATUS_AUTHORIZED
    }
}
