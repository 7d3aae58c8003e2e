//! The owning application seen from the hub.

use vxproto_types::{AgentInfo, Packet};

/// Services the embedding application provides to the hub.
pub trait HubApp: Send + Sync + 'static {
    /// Receives packets addressed to a module whose consumer has gone away.
    fn default_receiver(&self, packet: Packet);

    /// Accepts or refuses an agent during the handshake.
    fn validate_agent_info(&self, info: &AgentInfo) -> Result<(), String>;

    /// Version reported to connecting agents.
    fn version(&self) -> String;
}

/// Application that accepts every agent and logs orphaned packets.
#[derive(Debug, Default, Clone)]
pub struct LoggingApp;

impl HubApp for LoggingApp {
    fn default_receiver(&self, mut packet: Packet) {
        tracing::warn!(
            module = %packet.module,
            src = %packet.src,
            ptype = packet.packet_type().as_str(),
            "no consumer for packet, dropping"
        );
        packet.set_ack();
    }

    fn validate_agent_info(&self, info: &AgentInfo) -> Result<(), String> {
        if info.id.is_empty() {
            return Err("agent id is empty".to_string());
        }
        Ok(())
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }
}
