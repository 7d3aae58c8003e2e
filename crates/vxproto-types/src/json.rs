//! JSON encoding of packets, equivalent to the protobuf wire form.
//!
//! Binary fields are base64 encoded. The packet type is written explicitly
//! next to the content so a mismatching document is rejected on decode.

use crate::packet::{
    Action, Control, ControlMsgType, Data, File, Msg, MsgType, Packet, PacketType, Payload, Text,
    TraceContext,
};
use crate::{AgentInfo, ProtoError};
use serde::{Deserialize, Serialize};

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum JsonContent {
    Data {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    File {
        #[serde(with = "b64")]
        data: Vec<u8>,
        name: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        uniq: String,
        #[serde(default)]
        upgrader: bool,
    },
    Text {
        #[serde(with = "b64")]
        data: Vec<u8>,
        name: String,
    },
    Msg {
        #[serde(with = "b64")]
        data: Vec<u8>,
        mtype: MsgType,
    },
    Action {
        #[serde(with = "b64")]
        data: Vec<u8>,
        name: String,
    },
    Control {
        msg_type: ControlMsgType,
        #[serde(default)]
        agent: Option<AgentInfo>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonPacket {
    module: String,
    src: String,
    dst: String,
    timestamp: i64,
    #[serde(rename = "type")]
    ptype: PacketType,
    content: JsonContent,
    #[serde(with = "b64", default)]
    trace_id: Vec<u8>,
    #[serde(with = "b64", default)]
    pspan_id: Vec<u8>,
}

impl JsonContent {
    fn packet_type(&self) -> PacketType {
        match self {
            Self::Data { .. } => PacketType::Data,
            Self::File { .. } => PacketType::File,
            Self::Text { .. } => PacketType::Text,
            Self::Msg { .. } => PacketType::Msg,
            Self::Action { .. } => PacketType::Action,
            Self::Control { .. } => PacketType::Control,
        }
    }
}

impl From<&Payload> for JsonContent {
    fn from(payload: &Payload) -> Self {
        match payload.clone() {
            Payload::Data(p) => Self::Data { data: p.data },
            Payload::File(p) => Self::File {
                data: p.data,
                name: p.name,
                path: p.path,
                uniq: p.uniq,
                upgrader: p.upgrader,
            },
            Payload::Text(p) => Self::Text {
                data: p.data,
                name: p.name,
            },
            Payload::Msg(p) => Self::Msg {
                data: p.data,
                mtype: p.mtype,
            },
            Payload::Action(p) => Self::Action {
                data: p.data,
                name: p.name,
            },
            Payload::Control(p) => Self::Control {
                msg_type: p.msg_type,
                agent: p.agent,
            },
        }
    }
}

impl From<JsonContent> for Payload {
    fn from(content: JsonContent) -> Self {
        match content {
            JsonContent::Data { data } => Payload::Data(Data { data }),
            JsonContent::File {
                data,
                name,
                path,
                uniq,
                upgrader,
            } => Payload::File(File {
                data,
                name,
                path,
                uniq,
                upgrader,
            }),
            JsonContent::Text { data, name } => Payload::Text(Text { data, name }),
            JsonContent::Msg { data, mtype } => Payload::Msg(Msg { data, mtype }),
            JsonContent::Action { data, name } => Payload::Action(Action { data, name }),
            JsonContent::Control { msg_type, agent } => {
                Payload::Control(Control { msg_type, agent })
            }
        }
    }
}

/// Serializes a packet to JSON.
pub fn to_json(packet: &Packet) -> Result<String, ProtoError> {
    let doc = JsonPacket {
        module: packet.module.clone(),
        src: packet.src.clone(),
        dst: packet.dst.clone(),
        timestamp: packet.timestamp,
        ptype: packet.packet_type(),
        content: JsonContent::from(&packet.payload),
        trace_id: packet.trace.trace_id.clone(),
        pspan_id: packet.trace.parent_span_id.clone(),
    };
    Ok(serde_json::to_string(&doc)?)
}

/// Parses a packet from JSON, rejecting documents whose `type` disagrees
/// with their content.
pub fn from_json(s: &str) -> Result<Packet, ProtoError> {
    let doc: JsonPacket = serde_json::from_str(s)?;
    if doc.ptype != doc.content.packet_type() {
        return Err(ProtoError::PayloadMismatch(doc.ptype.to_string()));
    }
    Ok(Packet::from_parts(
        doc.module,
        doc.src,
        doc.dst,
        doc.timestamp,
        doc.content.into(),
        TraceContext {
            trace_id: doc.trace_id,
            parent_span_id: doc.pspan_id,
        },
    ))
}
