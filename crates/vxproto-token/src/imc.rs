//! IMC (inter-module communication) addresses.
//!
//! Module tokens and topic tokens share the 40-hex-character shape of agent
//! tokens but live in reserved prefixes, so a destination string alone tells
//! the hub how to deliver a packet.

use crate::{token_bytes, TokenCipher};
use sha2::{Digest, Sha256};

/// Prefix of module IMC tokens.
pub const IMC_TOKEN_PREFIX: &str = "ffffffff";
/// Prefix of IMC topic tokens.
pub const IMC_TOPIC_PREFIX: &str = "ffff7777";

/// How a destination string is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Fan-out to every subscriber of the topic.
    ImcTopic,
    /// Direct in-process delivery to one module socket.
    ImcToken,
    /// Uses a reserved prefix (or is empty) but is not a valid address.
    Malformed,
    /// Routed through the hub to an agent connection.
    Hub,
}

/// Classifies a destination in delivery priority order.
pub fn classify_destination(dst: &str) -> Destination {
    if dst.is_empty() {
        return Destination::Malformed;
    }
    let well_formed = token_bytes(dst).is_some();
    if dst.starts_with(IMC_TOPIC_PREFIX) {
        if well_formed {
            Destination::ImcTopic
        } else {
            Destination::Malformed
        }
    } else if dst.starts_with(IMC_TOKEN_PREFIX) {
        if well_formed {
            Destination::ImcToken
        } else {
            Destination::Malformed
        }
    } else {
        Destination::Hub
    }
}

pub fn is_imc_token(dst: &str) -> bool {
    classify_destination(dst) == Destination::ImcToken
}

pub fn is_imc_topic(dst: &str) -> bool {
    classify_destination(dst) == Destination::ImcTopic
}

impl TokenCipher {
    fn keyed_address(&self, prefix: &str, domain: &str, name: &str, group_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(group_id.as_bytes());
        hasher.update(b":");
        hasher.update(self.key());
        let digest = hasher.finalize();
        format!("{}{}", prefix, hex::encode(&digest[..16]))
    }

    /// IMC token of the module `name` in group `group_id`.
    pub fn make_imc_token(&self, name: &str, group_id: &str) -> String {
        self.keyed_address(IMC_TOKEN_PREFIX, "module", name, group_id)
    }

    /// IMC topic token of the topic `name` in group `group_id`.
    pub fn make_imc_topic(&self, name: &str, group_id: &str) -> String {
        self.keyed_address(IMC_TOPIC_PREFIX, "topic", name, group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vxproto_types::AgentType;

    #[test]
    fn module_tokens_are_stable_per_name_and_group() {
        let c = TokenCipher::new(*b"0123456789ab");
        let a = c.make_imc_token("scanner", "g1");
        assert_eq!(a, c.make_imc_token("scanner", "g1"));
        assert_ne!(a, c.make_imc_token("scanner", "g2"));
        assert_ne!(a, c.make_imc_token("scanner2", "g1"));
        assert_eq!(a.len(), crate::TOKEN_HEX_LEN);
        assert_eq!(classify_destination(&a), Destination::ImcToken);
    }

    #[test]
    fn topics_and_tokens_do_not_overlap() {
        let c = TokenCipher::new(*b"0123456789ab");
        let topic = c.make_imc_topic("events", "");
        assert!(is_imc_topic(&topic));
        assert!(!is_imc_token(&topic));
        assert_ne!(topic, c.make_imc_token("events", ""));
    }

    #[test]
    fn classification_covers_malformed_and_hub() {
        assert_eq!(classify_destination(""), Destination::Malformed);
        assert_eq!(classify_destination("ffffffff"), Destination::Malformed);
        assert_eq!(
            classify_destination(&format!("ffff7777{}", "Z".repeat(32))),
            Destination::Malformed
        );
        let agent = TokenCipher::new(*b"0123456789ab")
            .new_token("agent-1", AgentType::VxAgent)
            .unwrap();
        assert_eq!(classify_destination(&agent), Destination::Hub);
    }
}
