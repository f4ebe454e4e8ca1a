use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::commands::parse_command;
use crate::config::Config;
use crate::features::FeatureRegistry;
use crate::store::{ChatFeatureStore, StoreError};
use crate::vk::api::{OutboundSender, OutgoingMessage};
use crate::vk::update::{ServiceAction, Update, CHAT_PEER_OFFSET, MESSAGE};

/// Built-in admin command vocabulary.
const COMMANDS: &[&str] = &["add", "on", "remove", "off", "help"];

/// Routes each incoming update through command handling, service-message
/// handling and feature fan-out.
///
/// Holds a write-through cache of the store's feature → chats mapping;
/// every mutation updates the store and the cache together.
pub struct Dispatcher {
    bot_id: i64,
    default_features: HashSet<String>,
    store: ChatFeatureStore,
    registry: FeatureRegistry,
    sender: Arc<dyn OutboundSender>,
    feature_chats: HashMap<String, Vec<i64>>,
    chats: HashSet<i64>,
}

impl Dispatcher {
    pub async fn new(
        config: &Config,
        store: ChatFeatureStore,
        registry: FeatureRegistry,
        sender: Arc<dyn OutboundSender>,
    ) -> Result<Self, StoreError> {
        let default_features = config.default_feature_set();
        let feature_chats = store
            .feature_chats_index(&registry.names(), &default_features)
            .await?;
        let chats = store.chats().await?;

        info!(
            "dispatcher ready: {} feature(s), {} known chat(s)",
            registry.len(),
            chats.len()
        );

        Ok(Self {
            bot_id: config.vk.bot_id,
            default_features,
            store,
            registry,
            sender,
            feature_chats,
            chats,
        })
    }

    /// Process one batch of updates in order. Never fails: per-update
    /// faults are logged and the rest of the batch continues.
    pub async fn handle_batch(&mut self, updates: &[Update]) {
        for update in updates {
            self.handle_update(update).await;
        }
    }

    async fn handle_update(&mut self, update: &Update) {
        // Echo filter: self-sent messages never drive the built-in admin
        // commands. Feature handlers re-check the bit themselves.
        if update.event_code == MESSAGE && !update.is_outbound() {
            if let Some(chat_id) = update.chat_id() {
                if !self.chats.contains(&chat_id) {
                    self.register_chat(chat_id).await;
                }
                if !self.try_builtin_command(update, chat_id).await {
                    self.handle_service_message(update, chat_id).await;
                }
            }
        }

        self.fan_out(update).await;
    }

    /// First observation of a chat: persist it, enable the default set in
    /// the cache and tell every feature.
    async fn register_chat(&mut self, chat_id: i64) {
        if let Err(err) = self.store.add_chat(chat_id).await {
            // Not cached either, so the next update retries.
            warn!("failed to persist new chat {}: {}", chat_id, err);
            return;
        }
        self.chats.insert(chat_id);
        for name in &self.default_features {
            self.feature_chats.entry(name.clone()).or_default().push(chat_id);
        }
        for feature in self.registry.iter() {
            feature.on_chat_added(chat_id).await;
        }
        info!("registered new chat {}", chat_id);
    }

    /// Run the built-in command handling for a message addressed to the
    /// bot. Returns true when a command was recognized; one command per
    /// message.
    async fn try_builtin_command(&mut self, update: &Update, chat_id: i64) -> bool {
        let trimmed = update.text.trim();
        let mention = format!("[id{}|", self.bot_id);
        if !trimmed.starts_with(&mention) {
            return false;
        }

        let Some(tokens) = parse_command(trimmed, COMMANDS) else {
            return false;
        };
        debug!("command {:?} in chat {}", tokens, chat_id);

        let args = &tokens[1..];
        match tokens[0].as_str() {
            "add" | "on" => self.command_add(chat_id, args).await,
            "remove" | "off" => self.command_remove(chat_id, args).await,
            "help" => self.command_help(chat_id).await,
            _ => {}
        }
        true
    }

    async fn command_add(&mut self, chat_id: i64, args: &[String]) {
        let Some(feature_name) = args.first() else {
            self.reply(chat_id, "Usage: add <feature>").await;
            return;
        };
        if !self.registry.contains(feature_name) {
            self.reply(chat_id, &format!("No such feature: {}", feature_name))
                .await;
            return;
        }
        if self.enabled_in(feature_name, chat_id) {
            self.reply(
                chat_id,
                &format!("Feature {} is already enabled here", feature_name),
            )
            .await;
            return;
        }

        // Default features are implicit in the store; re-enabling one only
        // touches the cache.
        if !self.default_features.contains(feature_name) {
            match self.store.add_feature(chat_id, feature_name).await {
                Ok(()) | Err(StoreError::FeatureAlreadyEnabled { .. }) => {}
                Err(err) => {
                    warn!(
                        "failed to enable {} for chat {}: {}",
                        feature_name, chat_id, err
                    );
                    self.reply(chat_id, "Something went wrong, try again later")
                        .await;
                    return;
                }
            }
        }

        self.feature_chats
            .entry(feature_name.clone())
            .or_default()
            .push(chat_id);
        if let Some(feature) = self.registry.get(feature_name) {
            feature.on_chat_added(chat_id).await;
        }
        info!("enabled feature {} in chat {}", feature_name, chat_id);
        self.reply(chat_id, &format!("Enabled feature: {}", feature_name))
            .await;
    }

    async fn command_remove(&mut self, chat_id: i64, args: &[String]) {
        let Some(feature_name) = args.first() else {
            self.reply(chat_id, "Usage: remove <feature>").await;
            return;
        };
        if !self.registry.contains(feature_name) {
            self.reply(chat_id, &format!("No such feature: {}", feature_name))
                .await;
            return;
        }
        if !self.enabled_in(feature_name, chat_id) {
            self.reply(
                chat_id,
                &format!("Feature {} is already disabled here", feature_name),
            )
            .await;
            return;
        }

        // A default feature has no per-chat row to delete; its absence
        // from the store is what marks it default.
        if !self.default_features.contains(feature_name) {
            match self.store.remove_feature(chat_id, feature_name).await {
                Ok(()) | Err(StoreError::FeatureNotEnabled { .. }) => {}
                Err(err) => {
                    warn!(
                        "failed to disable {} for chat {}: {}",
                        feature_name, chat_id, err
                    );
                    self.reply(chat_id, "Something went wrong, try again later")
                        .await;
                    return;
                }
            }
        }

        if let Some(chats) = self.feature_chats.get_mut(feature_name.as_str()) {
            chats.retain(|&c| c != chat_id);
        }
        if let Some(feature) = self.registry.get(feature_name) {
            feature.on_chat_removed(chat_id).await;
        }
        info!("disabled feature {} in chat {}", feature_name, chat_id);
        self.reply(chat_id, &format!("Disabled feature: {}", feature_name))
            .await;
    }

    async fn command_help(&self, chat_id: i64) {
        let mut text = String::from(
            "Commands (mention me first):\n\
             add/on <feature> - enable a feature in this chat\n\
             remove/off <feature> - disable a feature\n\
             help - this message\n\n\
             Installed features:\n",
        );
        for name in self.registry.names() {
            text.push_str(&format!("  - {}\n", name));
        }
        self.reply(chat_id, &text).await;
    }

    async fn handle_service_message(&mut self, update: &Update, chat_id: i64) {
        let Some(action) = update.service_action() else {
            return;
        };

        match action {
            // The bot joining via an invite link is a new-chat event, which
            // first-update registration above already covered.
            ServiceAction::InvitedByLink { user_id } if user_id == self.bot_id => {
                debug!("bot joined chat {} via invite link", chat_id);
            }
            ServiceAction::MemberAdded { user_id }
            | ServiceAction::InvitedByLink { user_id } => {
                for feature in self.registry.iter() {
                    feature.on_member_added(chat_id, user_id).await;
                }
            }
            ServiceAction::MemberRemoved { user_id } if user_id == self.bot_id => {
                info!("bot was removed from chat {}", chat_id);
                for feature in self.registry.iter() {
                    feature.on_chat_removed(chat_id).await;
                }
            }
            ServiceAction::MemberRemoved { user_id } => {
                for feature in self.registry.iter() {
                    feature.on_member_removed(chat_id, user_id).await;
                }
            }
        }
    }

    /// Route the update to every feature that both listens for its event
    /// code and is enabled in its chat. A failing feature never blocks the
    /// others.
    async fn fan_out(&self, update: &Update) {
        let Some(chat_id) = update.chat_id() else {
            return;
        };
        for feature in self.registry.iter() {
            if !feature.triggered_by().contains(&update.event_code) {
                continue;
            }
            if !self.enabled_in(feature.name(), chat_id) {
                continue;
            }
            if let Err(err) = feature.handle(update).await {
                warn!(
                    "feature {} failed on update {}: {}",
                    feature.name(),
                    update.message_id,
                    err
                );
            }
        }
    }

    fn enabled_in(&self, feature: &str, chat_id: i64) -> bool {
        self.feature_chats
            .get(feature)
            .is_some_and(|chats| chats.contains(&chat_id))
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        let message = OutgoingMessage::text(chat_id + CHAT_PEER_OFFSET, text);
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to send reply to chat {}: {}", chat_id, err);
        }
    }
}
