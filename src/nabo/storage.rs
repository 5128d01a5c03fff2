//! Outbound queue persistence.
//!
//! The queue itself is a pure data structure; durability is delegated
//! to an injected [`OutboundStorage`] collaborator so the same pipeline
//! logic runs in tests without I/O. Records are saved per conversation
//! and survive reloads; the in-memory implementation backs tests and
//! embedders that opt out of persistence.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Row, Sqlite, SqlitePool};
use std::path::PathBuf;
use thiserror::Error;

use crate::nabo::outbound::OutboundRecord;
use crate::types::ConversationId;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait OutboundStorage: Send + Sync {
    /// All persisted records, queued and failed, across conversations.
    async fn load_all(&self) -> Result<Vec<OutboundRecord>, StorageError>;

    /// Overwrite the persisted set for one conversation.
    async fn save_conversation(
        &self,
        conversation_id: &ConversationId,
        records: &[OutboundRecord],
    ) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;
}

/// Non-durable storage. Default when no data directory is configured.
#[derive(Debug, Default)]
pub struct MemoryOutboundStorage {
    records: DashMap<ConversationId, Vec<OutboundRecord>>,
}

impl MemoryOutboundStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboundStorage for MemoryOutboundStorage {
    async fn load_all(&self) -> Result<Vec<OutboundRecord>, StorageError> {
        Ok(self
            .records
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect())
    }

    async fn save_conversation(
        &self,
        conversation_id: &ConversationId,
        records: &[OutboundRecord],
    ) -> Result<(), StorageError> {
        if records.is_empty() {
            self.records.remove(conversation_id);
        } else {
            self.records
                .insert(conversation_id.clone(), records.to_vec());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.records.clear();
        Ok(())
    }
}

/// SQLite-backed storage. Records are stored as JSON rows keyed by
/// conversation, ordered by insertion so FIFO order survives a reload.
#[derive(Debug, Clone)]
pub struct SqliteOutboundStorage {
    pool: SqlitePool,
}

impl SqliteOutboundStorage {
    pub async fn new(db_path: PathBuf) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("{}", db_path.display());
        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            Sqlite::create_database(&db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA busy_timeout=5000")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("{}?mode=rwc", db_url))
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS outbound_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                temp_id TEXT NOT NULL,
                record TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbound_conversation
             ON outbound_records (conversation_id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl OutboundStorage for SqliteOutboundStorage {
    async fn load_all(&self) -> Result<Vec<OutboundRecord>, StorageError> {
        let rows = sqlx::query("SELECT record FROM outbound_records ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("record");
            records.push(serde_json::from_str(&raw)?);
        }
        Ok(records)
    }

    async fn save_conversation(
        &self,
        conversation_id: &ConversationId,
        records: &[OutboundRecord],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM outbound_records WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        for record in records {
            let raw = serde_json::to_string(record)?;
            sqlx::query(
                "INSERT INTO outbound_records (conversation_id, temp_id, record)
                 VALUES (?, ?, ?)",
            )
            .bind(conversation_id)
            .bind(&record.temp_id)
            .bind(raw)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM outbound_records")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nabo::outbound::test_record;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryOutboundStorage::new();
        let records = vec![test_record("t1", "c1"), test_record("t2", "c1")];

        storage
            .save_conversation(&"c1".to_string(), &records)
            .await
            .unwrap();

        let loaded = storage.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_storage_empty_save_clears() {
        let storage = MemoryOutboundStorage::new();
        storage
            .save_conversation(&"c1".to_string(), &[test_record("t1", "c1")])
            .await
            .unwrap();
        storage
            .save_conversation(&"c1".to_string(), &[])
            .await
            .unwrap();

        assert!(storage.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("outbound.sqlite");

        {
            let storage = SqliteOutboundStorage::new(path.clone()).await.unwrap();
            storage
                .save_conversation(
                    &"c1".to_string(),
                    &[test_record("t1", "c1"), test_record("t2", "c1")],
                )
                .await
                .unwrap();
        }

        let storage = SqliteOutboundStorage::new(path).await.unwrap();
        let loaded = storage.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        // Insertion order preserved
        assert_eq!(loaded[0].temp_id, "t1");
        assert_eq!(loaded[1].temp_id, "t2");
    }

    #[tokio::test]
    async fn test_sqlite_save_overwrites_conversation() {
        let dir = TempDir::new().unwrap();
        let storage = SqliteOutboundStorage::new(dir.path().join("outbound.sqlite"))
            .await
            .unwrap();

        storage
            .save_conversation(&"c1".to_string(), &[test_record("t1", "c1")])
            .await
            .unwrap();
        storage
            .save_conversation(&"c1".to_string(), &[test_record("t2", "c1")])
            .await
            .unwrap();
        storage
            .save_conversation(&"c2".to_string(), &[test_record("t9", "c2")])
            .await
            .unwrap();

        let loaded = storage.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|r| r.temp_id == "t2"));
        assert!(loaded.iter().any(|r| r.temp_id == "t9"));
        assert!(!loaded.iter().any(|r| r.temp_id == "t1"));
    }

    #[tokio::test]
    async fn test_sqlite_clear() {
        let dir = TempDir::new().unwrap();
        let storage = SqliteOutboundStorage::new(dir.path().join("outbound.sqlite"))
            .await
            .unwrap();

        storage
            .save_conversation(&"c1".to_string(), &[test_record("t1", "c1")])
            .await
            .unwrap();
        storage.clear().await.unwrap();

        assert!(storage.load_all().await.unwrap().is_empty());
    }
}
