pub mod forward;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::vk::api::{OutboundSender, VkApiError};
use crate::vk::update::Update;

/// An optional, per-chat toggleable behavior module.
///
/// The lifecycle hooks have empty default bodies, so a feature that does
/// not care about chat or membership changes simply omits them.
#[async_trait]
pub trait Feature: Send + Sync {
    /// Unique name used in config lists and admin commands.
    fn name(&self) -> &str;

    /// Long Poll event codes this feature wants to receive.
    fn triggered_by(&self) -> &[i64];

    /// Handle one update in a chat where this feature is enabled.
    /// Features decide for themselves whether to react to outbound echoes.
    async fn handle(&self, update: &Update) -> Result<(), VkApiError>;

    async fn on_chat_added(&self, _chat_id: i64) {}
    async fn on_chat_removed(&self, _chat_id: i64) {}
    async fn on_member_added(&self, _chat_id: i64, _user_id: i64) {}
    async fn on_member_removed(&self, _chat_id: i64, _user_id: i64) {}
}

/// Registry of all installed features, in configuration order.
pub struct FeatureRegistry {
    features: Vec<Arc<dyn Feature>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self {
            features: Vec::new(),
        }
    }

    /// Register a feature
    pub fn register(&mut self, feature: Arc<dyn Feature>) {
        info!("Registered feature: {}", feature.name());
        self.features.push(feature);
    }

    /// Get a feature by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Feature>> {
        self.features.iter().find(|f| f.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.features.iter().any(|f| f.name() == name)
    }

    /// Installed feature names, in registration order
    pub fn names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Feature>> {
        self.features.iter()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Assemble the registry from the configured installed-feature list.
/// The name → constructor table is static; an unknown name is a
/// configuration error, not a runtime lookup.
pub fn build_registry(config: &Config, sender: Arc<dyn OutboundSender>) -> Result<FeatureRegistry> {
    let mut registry = FeatureRegistry::new();
    for name in &config.features.installed {
        let feature: Arc<dyn Feature> = match name.as_str() {
            forward::NAME => {
                let receiver = config
                    .features
                    .forward_receiver
                    .context("forward feature is installed but forward_receiver is not set")?;
                Arc::new(forward::ForwardMessages::new(sender.clone(), receiver))
            }
            other => bail!("unknown feature {:?} in installed list", other),
        };
        registry.register(feature);
    }
    Ok(registry)
}
