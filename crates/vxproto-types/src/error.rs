//! Error types for packet encoding and decoding.

/// Errors raised while encoding, decoding or validating packets.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The wire content type is not one of the known packet types.
    #[error("unknown packet type: {0}")]
    UnknownPacketType(i32),

    /// The wire message type of a Msg payload is not known.
    #[error("unknown message type: {0}")]
    UnknownMsgType(i32),

    /// The declared packet type does not match the payload variant.
    #[error("payload does not match packet type {0}")]
    PayloadMismatch(String),

    /// The wire packet carries no content.
    #[error("packet has no content")]
    MissingContent,

    /// The packet type only exists inside the hub.
    #[error("packet type {0} cannot be sent over the wire")]
    NotWireEncodable(String),

    /// An agent type label could not be parsed.
    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),

    /// Protobuf decoding failed.
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
