use std::sync::Arc;

use async_trait::async_trait;

use crate::features::Feature;
use crate::vk::api::{OutboundSender, OutgoingMessage, VkApiError};
use crate::vk::update::{Update, MESSAGE};

pub const NAME: &str = "forward";

/// Forwards every inbound message from its enabled chats to a fixed
/// receiver peer.
pub struct ForwardMessages {
    sender: Arc<dyn OutboundSender>,
    receiver_id: i64,
    triggers: [i64; 1],
}

impl ForwardMessages {
    pub fn new(sender: Arc<dyn OutboundSender>, receiver_id: i64) -> Self {
        Self {
            sender,
            receiver_id,
            triggers: [MESSAGE],
        }
    }
}

#[async_trait]
impl Feature for ForwardMessages {
    fn name(&self) -> &str {
        NAME
    }

    fn triggered_by(&self) -> &[i64] {
        &self.triggers
    }

    async fn handle(&self, update: &Update) -> Result<(), VkApiError> {
        if update.is_outbound() {
            return Ok(());
        }
        let mut message = OutgoingMessage::text(
            self.receiver_id,
            format!("from peer {}: {}", update.peer_id, update.text),
        );
        message.forward_messages = Some(update.message_id);
        self.sender.send(message).await
    }
}
