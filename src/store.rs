use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chat {0} is not known")]
    UnknownChat(i64),
    #[error("feature {feature:?} is already enabled for chat {chat_id}")]
    FeatureAlreadyEnabled { chat_id: i64, feature: String },
    #[error("feature {feature:?} is not enabled for chat {chat_id}")]
    FeatureNotEnabled { chat_id: i64, feature: String },
    #[error("corrupt feature list for chat {chat_id}")]
    Corrupt {
        chat_id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Thread-safe SQLite store of the durable chat → enabled-feature-set
/// mapping. A chat's row is created on first observation and never deleted;
/// default features are implicit and never written here.
#[derive(Clone)]
pub struct ChatFeatureStore {
    conn: Arc<Mutex<Connection>>,
}

impl ChatFeatureStore {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // journal_mode PRAGMA returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::run_migrations(&conn)?;

        info!("chat feature store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS features (
                chat_id INTEGER PRIMARY KEY,
                enabled_features TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Register a chat. A no-op when the chat is already known.
    pub async fn add_chat(&self, chat_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO features (chat_id, enabled_features) VALUES (?1, '[]')",
            params![chat_id],
        )?;
        if changed == 0 {
            debug!("chat {} is already in the store", chat_id);
        } else {
            info!("added chat {} to the store", chat_id);
        }
        Ok(())
    }

    /// Persisted feature set of one chat (defaults are not included).
    #[allow(dead_code)]
    pub async fn enabled_features(&self, chat_id: i64) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.conn.lock().await;
        load_features(&conn, chat_id)
    }

    /// All chats observed so far.
    pub async fn chats(&self) -> Result<HashSet<i64>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT chat_id FROM features")?;
        let chats = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(chats)
    }

    /// Enable a feature for a chat.
    pub async fn add_feature(&self, chat_id: i64, feature: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let mut features = load_features(&conn, chat_id)?;
        if !features.insert(feature.to_string()) {
            return Err(StoreError::FeatureAlreadyEnabled {
                chat_id,
                feature: feature.to_string(),
            });
        }
        save_features(&conn, chat_id, &features)?;
        info!("enabled feature {:?} for chat {}", feature, chat_id);
        Ok(())
    }

    /// Disable a feature for a chat. The row is left unmodified when the
    /// feature was not enabled.
    pub async fn remove_feature(&self, chat_id: i64, feature: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let mut features = load_features(&conn, chat_id)?;
        if !features.remove(feature) {
            return Err(StoreError::FeatureNotEnabled {
                chat_id,
                feature: feature.to_string(),
            });
        }
        save_features(&conn, chat_id, &features)?;
        info!("disabled feature {:?} for chat {}", feature, chat_id);
        Ok(())
    }

    /// Build the feature → chats index by scanning every known chat.
    /// Each chat's persisted set is unioned with the global default set, so
    /// a default feature maps to every known chat even when no chat has it
    /// persisted.
    pub async fn feature_chats_index(
        &self,
        installed: &[&str],
        defaults: &HashSet<String>,
    ) -> Result<HashMap<String, Vec<i64>>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT chat_id, enabled_features FROM features")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut per_chat = Vec::with_capacity(rows.len());
        for (chat_id, raw) in rows {
            let features: BTreeSet<String> = serde_json::from_str(&raw)
                .map_err(|source| StoreError::Corrupt { chat_id, source })?;
            per_chat.push((chat_id, features));
        }

        let mut index = HashMap::new();
        for &name in installed {
            let mut chats: Vec<i64> = per_chat
                .iter()
                .filter(|(_, features)| defaults.contains(name) || features.contains(name))
                .map(|(chat_id, _)| *chat_id)
                .collect();
            chats.sort_unstable();
            index.insert(name.to_string(), chats);
        }
        Ok(index)
    }
}

fn load_features(conn: &Connection, chat_id: i64) -> Result<BTreeSet<String>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT enabled_features FROM features WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )
        .optional()?;
    let raw = raw.ok_or(StoreError::UnknownChat(chat_id))?;
    serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt { chat_id, source })
}

fn save_features(
    conn: &Connection,
    chat_id: i64,
    features: &BTreeSet<String>,
) -> Result<(), StoreError> {
    let encoded = serde_json::to_string(features)
        .map_err(|source| StoreError::Corrupt { chat_id, source })?;
    conn.execute(
        "UPDATE features SET enabled_features = ?1 WHERE chat_id = ?2",
        params![encoded, chat_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_chat_is_idempotent() {
        let store = ChatFeatureStore::open_in_memory().unwrap();
        store.add_chat(123).await.unwrap();
        store.add_chat(123).await.unwrap();

        assert_eq!(store.chats().await.unwrap(), HashSet::from([123]));
        assert!(store.enabled_features(123).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_feature_requires_known_chat() {
        let store = ChatFeatureStore::open_in_memory().unwrap();
        match store.add_feature(5, "forward").await {
            Err(StoreError::UnknownChat(5)) => {}
            other => panic!("expected UnknownChat, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn add_then_remove_round_trips() {
        let store = ChatFeatureStore::open_in_memory().unwrap();
        store.add_chat(1).await.unwrap();
        let before = store.enabled_features(1).await.unwrap();

        store.add_feature(1, "forward").await.unwrap();
        assert!(store.enabled_features(1).await.unwrap().contains("forward"));

        store.remove_feature(1, "forward").await.unwrap();
        assert_eq!(store.enabled_features(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn duplicate_add_is_reported() {
        let store = ChatFeatureStore::open_in_memory().unwrap();
        store.add_chat(1).await.unwrap();
        store.add_feature(1, "forward").await.unwrap();

        match store.add_feature(1, "forward").await {
            Err(StoreError::FeatureAlreadyEnabled { chat_id: 1, .. }) => {}
            other => panic!("expected FeatureAlreadyEnabled, got {:?}", other),
        }
        // still enabled exactly once
        assert_eq!(store.enabled_features(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_of_never_added_feature_leaves_store_unmodified() {
        let store = ChatFeatureStore::open_in_memory().unwrap();
        store.add_chat(1).await.unwrap();
        store.add_feature(1, "other").await.unwrap();
        let before = store.enabled_features(1).await.unwrap();

        match store.remove_feature(1, "forward").await {
            Err(StoreError::FeatureNotEnabled { .. }) => {}
            other => panic!("expected FeatureNotEnabled, got {:?}", other),
        }
        assert_eq!(store.enabled_features(1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn index_unions_persisted_features_with_defaults() {
        let store = ChatFeatureStore::open_in_memory().unwrap();
        store.add_chat(10).await.unwrap();
        store.add_chat(20).await.unwrap();
        store.add_chat(30).await.unwrap();
        store.add_feature(10, "forward").await.unwrap();
        store.add_feature(30, "forward").await.unwrap();

        let defaults = HashSet::from(["help".to_string()]);
        let index = store
            .feature_chats_index(&["forward", "help", "unused"], &defaults)
            .await
            .unwrap();

        assert_eq!(index["forward"], vec![10, 30]);
        // a default feature maps to every known chat without being persisted
        assert_eq!(index["help"], vec![10, 20, 30]);
        assert_eq!(index["unused"], Vec::<i64>::new());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.sqlite3");

        {
            let store = ChatFeatureStore::open(&path).unwrap();
            store.add_chat(7).await.unwrap();
            store.add_feature(7, "forward").await.unwrap();
        }

        let store = ChatFeatureStore::open(&path).unwrap();
        assert_eq!(store.chats().await.unwrap(), HashSet::from([7]));
        assert!(store.enabled_features(7).await.unwrap().contains("forward"));
    }
}
