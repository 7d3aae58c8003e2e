//! Protobuf wire encoding of packets.
//!
//! ```text
//! Packet  { module=1, source=2, destination=3, timestamp=4, content=5,
//!           trace_id=6, pspan_id=7 }
//! Content { type=1, data=2, name=3, uniq=4, msg_type=5 }
//! ```
//!
//! Control packets are hub-internal and are rejected by [`encode`].

use crate::packet::{Action, Data, File, Msg, MsgType, Packet, Payload, Text, TraceContext};
use crate::ProtoError;
use prost::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ContentType {
    Data = 0,
    File = 1,
    Text = 2,
    Msg = 3,
    Action = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireContent {
    #[prost(enumeration = "ContentType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub uniq: String,
    #[prost(enumeration = "MsgType", tag = "5")]
    pub msg_type: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WirePacket {
    #[prost(string, tag = "1")]
    pub module: String,
    #[prost(string, tag = "2")]
    pub source: String,
    #[prost(string, tag = "3")]
    pub destination: String,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "5")]
    pub content: Option<WireContent>,
    #[prost(bytes = "vec", tag = "6")]
    pub trace_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub pspan_id: Vec<u8>,
}

fn content_of(payload: &Payload) -> Result<WireContent, ProtoError> {
    let mut content = WireContent::default();
    match payload {
        Payload::Data(p) => {
            content.r#type = ContentType::Data as i32;
            content.data = p.data.clone();
        }
        Payload::File(p) => {
            content.r#type = ContentType::File as i32;
            content.data = p.data.clone();
            content.name = p.name.clone();
            content.uniq = p.uniq.clone();
        }
        Payload::Text(p) => {
            content.r#type = ContentType::Text as i32;
            content.data = p.data.clone();
            content.name = p.name.clone();
        }
        Payload::Msg(p) => {
            content.r#type = ContentType::Msg as i32;
            content.data = p.data.clone();
            content.msg_type = p.mtype as i32;
        }
        Payload::Action(p) => {
            content.r#type = ContentType::Action as i32;
            content.data = p.data.clone();
            content.name = p.name.clone();
        }
        Payload::Control(_) => {
            return Err(ProtoError::NotWireEncodable("control".to_string()));
        }
    }
    Ok(content)
}

fn payload_of(content: WireContent) -> Result<Payload, ProtoError> {
    let ctype = ContentType::try_from(content.r#type)
        .map_err(|_| ProtoError::UnknownPacketType(content.r#type))?;
    let payload = match ctype {
        ContentType::Data => Payload::Data(Data { data: content.data }),
        ContentType::File => Payload::File(File {
            data: content.data,
            name: content.name,
            uniq: content.uniq,
            ..File::default()
        }),
        ContentType::Text => Payload::Text(Text {
            data: content.data,
            name: content.name,
        }),
        ContentType::Msg => {
            let mtype = MsgType::try_from(content.msg_type)
                .map_err(|_| ProtoError::UnknownMsgType(content.msg_type))?;
            Payload::Msg(Msg {
                data: content.data,
                mtype,
            })
        }
        ContentType::Action => Payload::Action(Action {
            data: content.data,
            name: content.name,
        }),
    };
    Ok(payload)
}

/// Encodes a packet into its protobuf representation.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, ProtoError> {
    let wire = WirePacket {
        module: packet.module.clone(),
        source: packet.src.clone(),
        destination: packet.dst.clone(),
        timestamp: packet.timestamp,
        content: Some(content_of(&packet.payload)?),
        trace_id: packet.trace.trace_id.clone(),
        pspan_id: packet.trace.parent_span_id.clone(),
    };
    Ok(wire.encode_to_vec())
}

/// Decodes a packet from its protobuf representation.
pub fn decode(bytes: &[u8]) -> Result<Packet, ProtoError> {
    let wire = WirePacket::decode(bytes)?;
    let content = wire.content.ok_or(ProtoError::MissingContent)?;
    let payload = payload_of(content)?;
    Ok(Packet::from_parts(
        wire.module,
        wire.source,
        wire.destination,
        wire.timestamp,
        payload,
        TraceContext {
            trace_id: wire.trace_id,
            parent_span_id: wire.pspan_id,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Control, ControlMsgType};

    #[test]
    fn file_chunk_survives_the_wire() {
        let mut pkt = Packet::new(
            "updater",
            "a".repeat(40),
            Payload::File(File {
                data: vec![1, 2, 3],
                name: "agent.bin".to_string(),
                uniq: "abc:2:3".to_string(),
                ..File::default()
            }),
        );
        pkt.src = "b".repeat(40);
        pkt.trace.trace_id = vec![9; 16];

        let decoded = decode(&encode(&pkt).unwrap()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn msg_type_is_preserved() {
        let pkt = Packet::new(
            "m",
            "d",
            Payload::Msg(Msg {
                data: b"disk full".to_vec(),
                mtype: MsgType::Error,
            }),
        );
        let decoded = decode(&encode(&pkt).unwrap()).unwrap();
        match decoded.payload {
            Payload::Msg(m) => assert_eq!(m.mtype, MsgType::Error),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn control_packets_are_not_wire_encodable() {
        let pkt = Packet::new(
            "m",
            "d",
            Payload::Control(Control {
                msg_type: ControlMsgType::StopModule,
                agent: None,
            }),
        );
        assert!(matches!(encode(&pkt), Err(ProtoError::NotWireEncodable(_))));
    }

    #[test]
    fn unknown_content_type_is_rejected() {
        let wire = WirePacket {
            content: Some(WireContent {
                r#type: 42,
                ..WireContent::default()
            }),
            ..WirePacket::default()
        };
        let err = decode(&wire.encode_to_vec()).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownPacketType(42)));
    }

    #[test]
    fn missing_content_is_rejected() {
        let wire = WirePacket::default();
        assert!(matches!(
            decode(&wire.encode_to_vec()),
            Err(ProtoError::MissingContent)
        ));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
    }
}
