mod bot;
mod commands;
mod config;
mod dispatcher;
mod features;
mod store;
mod vk;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::features::build_registry;
use crate::store::ChatFeatureStore;
use crate::vk::api::{OutboundSender, OutgoingMessage, VkApi};
use crate::vk::longpoll::LongPollTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vkbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Bot id: {}", config.vk.bot_id);
    info!("  Installed features: {:?}", config.features.installed);
    info!("  Default features: {:?}", config.features.default);
    info!("  Database: {}", config.database.path.display());

    let store = ChatFeatureStore::open(&config.database.path).with_context(|| {
        format!(
            "Failed to open database: {}",
            config.database.path.display()
        )
    })?;

    let api = Arc::new(VkApi::new(&config.vk));
    let registry = build_registry(&config, api.clone())?;
    let dispatcher = Dispatcher::new(&config, store, registry, api.clone())
        .await
        .context("Failed to build dispatcher")?;

    info!("Bot is starting...");
    let transport: Arc<dyn LongPollTransport> = api.clone();
    if let Err(err) = bot::run(transport, dispatcher, config.longpoll.wait).await {
        error!("Bot crashed: {:#}", err);
        // Best-effort heads-up to the maintainer; the chats never see
        // internals.
        let notice =
            OutgoingMessage::text(config.vk.maintainer_id, format!("vkbot crashed: {}", err));
        if let Err(send_err) = api.send(notice).await {
            error!("Failed to notify maintainer: {}", send_err);
        }
        return Err(err);
    }

    Ok(())
}
