//! History store backed by `sled`
//!
//! The router records every topic publish here so it can answer cache
//! requests. Each topic gets its own sled tree; keys are sled-generated
//! monotonic ids so iteration yields messages in publish order.
//!
//! Policy options:
//! - `ttl_seconds`: records older than this are removed during load
//! - `max_messages_per_topic`: oldest records are removed once a topic holds
//!   more than this many

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::Db;

use crate::message::Message;
use crate::topic::TopicPattern;
use crate::utils::error::HistoryError;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredMessage {
    pub message: Message,
    pub stored_at: i64,
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
    ttl_seconds: Option<i64>,
    max_messages_per_topic: Option<usize>,
}

impl Persistence {
    /// Opens (or creates) a store at `path`. `None` opens a temporary store
    /// that is removed when dropped.
    pub fn open(
        path: Option<&str>,
        ttl_seconds: Option<i64>,
        max_messages_per_topic: Option<usize>,
    ) -> Result<Self, HistoryError> {
        let db = match path {
            Some(path) => sled::open(path)?,
            None => sled::Config::new().temporary(true).open()?,
        };
        Ok(Self {
            db,
            ttl_seconds,
            max_messages_per_topic,
        })
    }

    /// Records `message` under its topic. Queue-addressed messages are not
    /// recorded.
    pub fn store_message(&self, message: &Message) -> Result<(), HistoryError> {
        let Some(topic) = message.topic() else {
            return Ok(());
        };

        let record = StoredMessage {
            message: message.clone(),
            stored_at: Utc::now().timestamp_millis(),
        };
        let serialized = serde_json::to_vec(&record)?;
        let tree = self.db.open_tree(topic)?;
        let key = self.db.generate_id()?;
        tree.insert(key.to_be_bytes(), serialized)?;

        if let Some(max) = self.max_messages_per_topic {
            while tree.len() > max {
                if tree.pop_min()?.is_none() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Loads up to `max_messages` most recent records per matching topic,
    /// oldest first.
    pub fn load_messages(
        &self,
        pattern: &TopicPattern,
        max_messages: usize,
    ) -> Result<Vec<StoredMessage>, HistoryError> {
        let mut out = Vec::new();
        for name in self.db.tree_names() {
            let Ok(topic) = std::str::from_utf8(&name) else {
                continue;
            };
            if topic.starts_with("__sled__") || !pattern.matches(topic) {
                continue;
            }
            self.cleanup_old_messages(topic)?;

            let tree = self.db.open_tree(topic)?;
            let mut records: Vec<StoredMessage> = tree
                .iter()
                .filter_map(|res| res.ok())
                .filter_map(|(_, val)| serde_json::from_slice(&val).ok())
                .collect();
            if max_messages > 0 && records.len() > max_messages {
                records.drain(..records.len() - max_messages);
            }
            out.extend(records);
        }
        out.sort_by_key(|r| r.stored_at);
        Ok(out)
    }

    fn cleanup_old_messages(&self, topic: &str) -> Result<(), HistoryError> {
        let Some(ttl) = self.ttl_seconds else {
            return Ok(());
        };
        let expiry = Utc::now().timestamp_millis() - ttl * 1000;

        let tree = self.db.open_tree(topic)?;
        let old_keys: Vec<_> = tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key, val)| {
                let record: StoredMessage = serde_json::from_slice(&val).ok()?;
                (record.stored_at < expiry).then_some(key)
            })
            .collect();

        for key in old_keys {
            tree.remove(key)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_messages_per_topic", &self.max_messages_per_topic)
            .finish()
    }
}
