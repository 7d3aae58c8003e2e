//! Agent protocol envelope carried inside Data packets.

use crate::ProtoError;
use prost::Message;

/// Business message types exchanged with the agent's `main` module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unknown = 0,
    GetInformation = 1,
    GetInformationResult = 2,
    GetStatusModules = 3,
    GetStatusModulesResult = 4,
    AgentUpgradeExecPush = 5,
    AgentUpgradeExecPushResult = 6,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::GetInformation => "GET_INFORMATION",
            Self::GetInformationResult => "GET_INFORMATION_RESULT",
            Self::GetStatusModules => "GET_STATUS_MODULES",
            Self::GetStatusModulesResult => "GET_STATUS_MODULES_RESULT",
            Self::AgentUpgradeExecPush => "AGENT_UPGRADE_EXEC_PUSH",
            Self::AgentUpgradeExecPushResult => "AGENT_UPGRADE_EXEC_PUSH_RESULT",
        }
    }
}

/// `Message { type = 1; payload = 2; }`
#[derive(Clone, PartialEq, prost::Message)]
pub struct AgentMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

impl AgentMessage {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            r#type: message_type as i32,
            payload,
        }
    }

    /// Decodes the envelope from a Data payload.
    pub fn parse(data: &[u8]) -> Result<Self, ProtoError> {
        Ok(Self::decode(data)?)
    }

    /// The declared message type, or `None` if the value is not known.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.r#type).ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_values_are_reported_as_none() {
        let msg = AgentMessage {
            r#type: 99,
            payload: vec![],
        };
        let parsed = AgentMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.message_type(), None);
    }

    #[test]
    fn upgrade_push_is_recognized() {
        let msg = AgentMessage::new(MessageType::AgentUpgradeExecPush, b"v2".to_vec());
        let parsed = AgentMessage::parse(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.message_type(), Some(MessageType::AgentUpgradeExecPush));
        assert_eq!(parsed.payload, b"v2");
    }
}
