//! The packet envelope and its payload variants.
//!
//! A [`Packet`] is the unit of everything the hub moves: agent traffic,
//! module-to-module messages and internal control notifications. The payload
//! is an enum, so a packet's type is always the type of its payload.

use crate::AgentInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

/// Discriminant of a packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketType {
    Data,
    File,
    Text,
    Msg,
    Action,
    Control,
}

impl PacketType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::File => "file",
            Self::Text => "text",
            Self::Msg => "msg",
            Self::Action => "action",
            Self::Control => "control",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a Msg payload.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, prost::Enumeration,
)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum MsgType {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

/// Kind of an internal control notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMsgType {
    AgentConnected,
    AgentDisconnected,
    StopModule,
}

/// Opaque binary payload, usually an encoded [`crate::AgentMessage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Data {
    pub data: Vec<u8>,
}

/// A file or one chunk of a file.
///
/// `uniq` is `"<transfer id>:<chunk index>:<total chunks>"` for chunked
/// transfers and empty for direct sends. Once a chunked transfer has been
/// reassembled, `path` points at the file on disk and `data` is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct File {
    pub data: Vec<u8>,
    pub name: String,
    pub path: String,
    pub uniq: String,
    /// Marks an agent upgrade artifact. Only meaningful inside the hub.
    pub upgrader: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Text {
    pub data: Vec<u8>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub data: Vec<u8>,
    pub mtype: MsgType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    pub data: Vec<u8>,
    pub name: String,
}

/// Hub-generated notification. Never leaves the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub msg_type: ControlMsgType,
    pub agent: Option<AgentInfo>,
}

/// Packet payload. The variant determines the packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data(Data),
    File(File),
    Text(Text),
    Msg(Msg),
    Action(Action),
    Control(Control),
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Data(_) => PacketType::Data,
            Self::File(_) => PacketType::File,
            Self::Text(_) => PacketType::Text,
            Self::Msg(_) => PacketType::Msg,
            Self::Action(_) => PacketType::Action,
            Self::Control(_) => PacketType::Control,
        }
    }
}

/// Trace correlation identifiers carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: Vec<u8>,
    pub parent_span_id: Vec<u8>,
}

/// Resolves once the packet it was split from has been acknowledged.
#[derive(Debug)]
pub struct AckWaiter(oneshot::Receiver<()>);

impl AckWaiter {
    /// Waits for the acknowledgement.
    ///
    /// Returns `false` if the packet was dropped without `set_ack`.
    pub async fn wait(self) -> bool {
        self.0.await.is_ok()
    }
}

/// The addressed envelope moved by the hub.
#[derive(Debug)]
pub struct Packet {
    pub module: String,
    pub src: String,
    pub dst: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub payload: Payload,
    pub trace: TraceContext,
    ack: Option<oneshot::Sender<()>>,
    span: tracing::Span,
}

impl Packet {
    /// Creates a packet stamped with the current time.
    pub fn new(module: impl Into<String>, dst: impl Into<String>, payload: Payload) -> Self {
        Self::from_parts(
            module.into(),
            String::new(),
            dst.into(),
            crate::now_millis(),
            payload,
            TraceContext::default(),
        )
    }

    /// Creates a packet from decoded fields.
    pub fn from_parts(
        module: String,
        src: String,
        dst: String,
        timestamp: i64,
        payload: Payload,
        trace: TraceContext,
    ) -> Self {
        let span = tracing::debug_span!(
            "packet",
            module = %module,
            ptype = payload.packet_type().as_str(),
        );
        Self {
            module,
            src,
            dst,
            timestamp,
            payload,
            trace,
            ack: None,
            span,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.payload.packet_type()
    }

    /// Attaches an acknowledgement channel and returns its receiving half.
    pub fn with_ack(mut self) -> (Self, AckWaiter) {
        let (tx, rx) = oneshot::channel();
        self.ack = Some(tx);
        (self, AckWaiter(rx))
    }

    /// Acknowledges the packet and closes its trace span.
    ///
    /// Only the first call has an effect.
    pub fn set_ack(&mut self) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(());
        }
        if !self.span.is_disabled() {
            self.span.in_scope(|| tracing::trace!(src = %self.src, dst = %self.dst, "packet acknowledged"));
            self.span = tracing::Span::none();
        }
    }

    /// Span covering the packet's lifetime inside the hub.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Returns the file payload, if any.
    pub fn file(&self) -> Option<&File> {
        match &self.payload {
            Payload::File(f) => Some(f),
            _ => None,
        }
    }

    /// Returns the raw bytes carried by the payload (empty for control packets).
    pub fn bytes(&self) -> &[u8] {
        match &self.payload {
            Payload::Data(p) => &p.data,
            Payload::File(p) => &p.data,
            Payload::Text(p) => &p.data,
            Payload::Msg(p) => &p.data,
            Payload::Action(p) => &p.data,
            Payload::Control(_) => &[],
        }
    }
}

/// Clones everything except the acknowledgement channel, which stays with
/// the original.
impl Clone for Packet {
    fn clone(&self) -> Self {
        Self {
            module: self.module.clone(),
            src: self.src.clone(),
            dst: self.dst.clone(),
            timestamp: self.timestamp,
            payload: self.payload.clone(),
            trace: self.trace.clone(),
            ack: None,
            span: self.span.clone(),
        }
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.module == other.module
            && self.src == other.src
            && self.dst == other.dst
            && self.timestamp == other.timestamp
            && self.payload == other.payload
            && self.trace == other.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_packet() -> Packet {
        Packet::new("m", "dst", Payload::Data(Data { data: b"x".to_vec() }))
    }

    #[tokio::test]
    async fn ack_resolves_waiter_once() {
        let (mut pkt, waiter) = data_packet().with_ack();
        pkt.set_ack();
        pkt.set_ack();
        assert!(waiter.wait().await);
    }

    #[tokio::test]
    async fn dropped_packet_reports_no_ack() {
        let (pkt, waiter) = data_packet().with_ack();
        drop(pkt);
        assert!(!waiter.wait().await);
    }

    #[tokio::test]
    async fn clone_does_not_carry_ack() {
        let (pkt, waiter) = data_packet().with_ack();
        let mut copy = pkt.clone();
        copy.set_ack();
        assert_eq!(copy, pkt);
        drop(pkt);
        assert!(!waiter.wait().await);
    }

    #[test]
    fn packet_type_follows_payload() {
        let pkt = Packet::new(
            "m",
            "d",
            Payload::Msg(Msg {
                data: vec![],
                mtype: MsgType::Warning,
            }),
        );
        assert_eq!(pkt.packet_type(), PacketType::Msg);
        assert!(pkt.file().is_none());
    }
}
