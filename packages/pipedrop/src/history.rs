//! Completed-transfer history backed by SQLite.
//!
//! Rows are written once the receiver has drained a pipe; nothing about the
//! file content itself is stored.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, warn};

/// A completed transfer as stored in `transfer_history`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub id: i64,
    pub sender: String,
    pub receiver: String,
    pub file_name: String,
    /// Size declared by the sender in the offer
    pub file_size: i64,
    /// Bytes actually copied through the pipe
    pub bytes_streamed: Option<i64>,
    pub created_at: i64,
}

/// Fields supplied when a transfer finishes.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub sender: String,
    pub receiver: String,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_streamed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub transfers: u64,
    pub total_bytes: u64,
}

#[derive(Clone)]
pub struct TransferHistory {
    pool: SqlitePool,
}

impl TransferHistory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, transfer: &NewTransfer) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfer_history (sender, receiver, file_name, file_size, bytes_streamed)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&transfer.sender)
        .bind(&transfer.receiver)
        .bind(&transfer.file_name)
        .bind(i64::try_from(transfer.file_size).unwrap_or(i64::MAX))
        .bind(i64::try_from(transfer.bytes_streamed).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(
            id,
            sender = %transfer.sender,
            receiver = %transfer.receiver,
            "Recorded transfer"
        );
        Ok(id)
    }

    /// Spawn `record` in the background; failures are logged and swallowed.
    pub fn record_detached(&self, transfer: NewTransfer) {
        let history = self.clone();
        tokio::spawn(async move {
            if let Err(e) = history.record(&transfer).await {
                warn!(
                    sender = %transfer.sender,
                    receiver = %transfer.receiver,
                    "Failed to record transfer history: {}",
                    e
                );
            }
        });
    }

    /// Most recent transfers first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<TransferRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sender, receiver, file_name, file_size, bytes_streamed, created_at
            FROM transfer_history
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| TransferRecord {
                id: r.get("id"),
                sender: r.get("sender"),
                receiver: r.get("receiver"),
                file_name: r.get("file_name"),
                file_size: r.get("file_size"),
                bytes_streamed: r.get("bytes_streamed"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<HistoryStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS transfers, COALESCE(SUM(file_size), 0) AS total_bytes FROM transfer_history",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(HistoryStats {
            transfers: row.try_get::<i64, _>("transfers").unwrap_or(0) as u64,
            total_bytes: row.try_get::<i64, _>("total_bytes").unwrap_or(0) as u64,
        })
    }
}

/// One line per transfer, in the style of the startup summary.
pub fn format_record(record: &TransferRecord) -> String {
    let when = chrono::DateTime::from_timestamp(record.created_at, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| record.created_at.to_string());
    format!(
        "[{}] {} -> {} | {} ({} bytes)",
        when, record.sender, record.receiver, record.file_name, record.file_size
    )
}

#[cfg(test)]
pub(crate) async fn test_history() -> TransferHistory {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    crate::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    TransferHistory::new(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(sender: &str, name: &str, size: u64) -> NewTransfer {
        NewTransfer {
            sender: sender.to_string(),
            receiver: "User-00002".to_string(),
            file_name: name.to_string(),
            file_size: size,
            bytes_streamed: size,
        }
    }

    #[tokio::test]
    async fn recent_on_empty_history() {
        let history = test_history().await;
        assert!(history.recent(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_and_list_newest_first() {
        let history = test_history().await;
        history
            .record(&transfer("User-00001", "a.txt", 10))
            .await
            .unwrap();
        history
            .record(&transfer("User-00003", "b.bin", 20))
            .await
            .unwrap();

        let records = history.recent(5).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file_name, "b.bin");
        assert_eq!(records[0].sender, "User-00003");
        assert_eq!(records[0].bytes_streamed, Some(20));
        assert_eq!(records[1].file_name, "a.txt");
    }

    #[tokio::test]
    async fn recent_respects_limit() {
        let history = test_history().await;
        for i in 0..7 {
            history
                .record(&transfer("User-00001", &format!("f{i}"), i))
                .await
                .unwrap();
        }
        let records = history.recent(5).await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].file_name, "f6");
    }

    #[tokio::test]
    async fn stats_sum_declared_sizes() {
        let history = test_history().await;
        history
            .record(&transfer("User-00001", "a", 1024))
            .await
            .unwrap();
        history
            .record(&transfer("User-00001", "b", 2048))
            .await
            .unwrap();

        let stats = history.stats().await.unwrap();
        assert_eq!(stats.transfers, 2);
        assert_eq!(stats.total_bytes, 3072);
    }

    #[test]
    fn format_record_line() {
        let record = TransferRecord {
            id: 1,
            sender: "User-00001".into(),
            receiver: "User-00002".into(),
            file_name: "x.txt".into(),
            file_size: 1024,
            bytes_streamed: Some(1024),
            created_at: 0,
        };
        assert_eq!(
            format_record(&record),
            "[1970-01-01 00:00:00] User-00001 -> User-00002 | x.txt (1024 bytes)"
        );
    }
}
