//! Inter-module communication.
//!
//! Modules address each other by IMC token (direct in-process delivery) or
//! by IMC topic (fan-out to every subscriber). Neither path touches an
//! agent transport unless a subscriber is itself a connection token.

use crate::error::HubError;
use crate::hub::VxProto;
use crate::module::ModuleSocket;
use vxproto_token::{classify_destination, is_imc_token, is_imc_topic, Destination};
use vxproto_types::Packet;

impl VxProto {
    /// Topic token of `name` in `group_id`.
    pub fn make_imc_topic(&self, name: &str, group_id: &str) -> String {
        self.cipher().make_imc_topic(name, group_id)
    }

    /// Adds `token` to a topic, creating the topic on first use.
    pub fn subscribe(&self, topic: &str, token: &str) -> Result<(), HubError> {
        self.ensure_topic(topic)?;
        let mut state = self.inner().write_state();
        let subscribers = state.topics.entry(topic.to_string()).or_default();
        if !subscribers.iter().any(|s| s == token) {
            subscribers.push(token.to_string());
        }
        Ok(())
    }

    /// Removes `token` from a topic, deleting the topic once empty.
    pub fn unsubscribe(&self, topic: &str, token: &str) -> Result<(), HubError> {
        self.ensure_topic(topic)?;
        let mut state = self.inner().write_state();
        let Some(subscribers) = state.topics.get_mut(topic) else {
            return Err(HubError::TopicUnreachable(topic.to_string()));
        };
        subscribers.retain(|s| s != token);
        if subscribers.is_empty() {
            state.topics.remove(topic);
        }
        Ok(())
    }

    pub fn topic_subscribers(&self, topic: &str) -> Option<Vec<String>> {
        self.inner().read_state().topics.get(topic).cloned()
    }

    fn ensure_topic(&self, topic: &str) -> Result<(), HubError> {
        if is_imc_topic(topic) {
            Ok(())
        } else {
            Err(HubError::DstMalformed(topic.to_string()))
        }
    }

    /// Delivers a packet straight to the module owning its IMC token.
    pub(crate) async fn deliver_imc(&self, packet: Packet) -> Result<(), HubError> {
        self.ensure_open()?;
        let module = self.inner().read_state().module_by_imc_token(&packet.dst);
        match module {
            Some(module) => module.recv_packet(packet).await,
            None => Err(HubError::DstUnreachable(packet.dst.clone())),
        }
    }

    /// Sends a copy of the packet to every subscriber of its topic.
    ///
    /// Every subscriber is attempted; the last failure, if any, is returned.
    pub(crate) async fn publish(&self, mut packet: Packet) -> Result<(), HubError> {
        self.ensure_open()?;
        let subscribers = self
            .topic_subscribers(&packet.dst)
            .ok_or_else(|| HubError::TopicUnreachable(packet.dst.clone()))?;

        let mut last_error = None;
        for subscriber in subscribers {
            let mut copy = packet.clone();
            copy.dst = subscriber;
            let result = if is_imc_token(&copy.dst) {
                self.deliver_imc(copy).await
            } else {
                self.send_packet(copy).await
            };
            if let Err(e) = result {
                tracing::debug!(topic = %packet.dst, error = %e, "topic delivery failed");
                last_error = Some(e);
            }
        }
        packet.set_ack();
        last_error.map_or(Ok(()), Err)
    }
}

impl ModuleSocket {
    /// Sends a packet, choosing delivery from the destination: topic
    /// fan-out, direct IMC delivery, or the hub for agent connections.
    pub async fn send_packet(&self, mut packet: Packet) -> Result<(), HubError> {
        let hub = self.hub()?;
        match classify_destination(&packet.dst) {
            Destination::ImcTopic => {
                packet.src = self.imc_token().to_string();
                hub.publish(packet).await
            }
            Destination::ImcToken => {
                packet.src = self.imc_token().to_string();
                hub.deliver_imc(packet).await
            }
            Destination::Malformed => Err(HubError::DstMalformed(packet.dst.clone())),
            Destination::Hub => hub.send_packet(packet).await,
        }
    }

    /// Subscribes this module to a topic token.
    pub fn subscribe(&self, topic: &str) -> Result<(), HubError> {
        self.hub()?.subscribe(topic, self.imc_token())
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), HubError> {
        self.hub()?.unsubscribe(topic, self.imc_token())
    }
}
