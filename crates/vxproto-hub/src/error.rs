//! Error types for the hub.

use crate::crypto::CryptoError;
use vxproto_policy::PolicyError;
use vxproto_token::TokenError;
use vxproto_types::ProtoError;

/// Errors raised by a [`crate::Transport`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("transport closed")]
    Closed,

    /// A write did not complete before its deadline.
    #[error("transport write timed out")]
    Timeout,

    /// The peer violated the framing protocol.
    #[error("framing error: {0}")]
    Framing(String),

    /// The underlying connection failed.
    #[error("transport error: {0}")]
    Io(String),
}

/// Errors raised by hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The hub has been shut down.
    #[error("hub is closed")]
    Closed,

    /// No module socket owns the IMC token.
    #[error("destination unreachable: {0}")]
    DstUnreachable(String),

    /// No subscriber list exists for the IMC topic.
    #[error("topic unreachable: {0}")]
    TopicUnreachable(String),

    /// The destination uses a reserved prefix but is not a valid address.
    #[error("destination malformed: {0:?}")]
    DstMalformed(String),

    /// A module with this name is already registered for the group.
    #[error("module {name} already registered for group {group_id:?}")]
    ModuleExists { name: String, group_id: String },

    /// No module with this name is registered for the group.
    #[error("module {name} not registered for group {group_id:?}")]
    ModuleNotFound { name: String, group_id: String },

    /// An agent connection with this token is already registered.
    #[error("agent connection {0} already registered")]
    AgentExists(String),

    /// No agent connection with this token is registered.
    #[error("agent connection {0} not found")]
    AgentNotFound(String),

    /// The module socket's consumer side is gone.
    #[error("module mailbox closed")]
    MailboxClosed,

    /// A file chunk could not be placed.
    #[error("bad file chunk: {0}")]
    BadChunk(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
}
