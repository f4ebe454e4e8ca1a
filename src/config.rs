use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vk: VkConfig,
    pub features: FeaturesConfig,
    #[serde(default = "default_database_config")]
    pub database: DatabaseConfig,
    #[serde(default = "default_longpoll_config")]
    pub longpoll: LongPollConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VkConfig {
    pub access_token: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// The bot's own numeric identity, used to recognize self-mentions.
    pub bot_id: i64,
    /// Peer notified when the poll loop dies.
    pub maintainer_id: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeaturesConfig {
    pub installed: Vec<String>,
    /// Features enabled in every chat without per-chat persistence.
    /// Must be a subset of `installed`.
    #[serde(default)]
    pub default: Vec<String>,
    /// Receiver peer id for the forward feature.
    #[serde(default)]
    pub forward_receiver: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LongPollConfig {
    /// Seconds the remote holds a poll request open.
    #[serde(default = "default_wait")]
    pub wait: u64,
}

fn default_api_version() -> String {
    "5.80".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("vkbot.sqlite3")
}

fn default_wait() -> u64 {
    25
}

fn default_database_config() -> DatabaseConfig {
    DatabaseConfig {
        path: default_db_path(),
    }
}

fn default_longpoll_config() -> LongPollConfig {
    LongPollConfig {
        wait: default_wait(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for name in &self.features.default {
            if !self.features.installed.contains(name) {
                bail!("default feature {:?} is not in the installed list", name);
            }
        }
        Ok(())
    }

    pub fn default_feature_set(&self) -> HashSet<String> {
        self.features.default.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [vk]
        access_token = "token"
        bot_id = 777
        maintainer_id = 555

        [features]
        installed = ["forward"]
        default = ["forward"]
        forward_receiver = 999
    "#;

    #[test]
    fn parses_with_defaults() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.vk.api_version, "5.80");
        assert_eq!(config.vk.bot_id, 777);
        assert_eq!(config.database.path, PathBuf::from("vkbot.sqlite3"));
        assert_eq!(config.longpoll.wait, 25);
        assert_eq!(config.features.forward_receiver, Some(999));
    }

    #[test]
    fn rejects_default_not_in_installed() {
        let broken = EXAMPLE.replace("installed = [\"forward\"]", "installed = []");
        let config: Config = toml::from_str(&broken).unwrap();
        assert!(config.validate().is_err());
    }
}
