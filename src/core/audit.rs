//! Append-only audit trail of allocation decisions, kept in SQLite.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use strum::{Display, EnumString};
use tokio::sync::{mpsc, oneshot};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS log (
    ts TEXT NOT NULL,
    action TEXT NOT NULL,
    detail TEXT NOT NULL
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    Register,
    Queue,
    Assign,
    Steal,
    Complete,
    Drop,
    Restore,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub ts: String,
    pub action: String,
    pub detail: String,
}

/// Synchronous handle on the audit database.
pub struct AuditStore {
    conn: Connection,
}

impl AuditStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open audit database {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize audit schema")?;
        Ok(Self { conn })
    }

    pub fn append(&self, action: AuditAction, detail: &str) -> Result<()> {
        let ts = chrono::Local::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO log (ts, action, detail) VALUES (?1, ?2, ?3)",
                params![ts, action.to_string(), detail],
            )
            .context("Failed to insert audit entry")?;
        Ok(())
    }

    /// The latest `limit` entries, oldest first.
    #[cfg(test)]
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ts, action, detail FROM log ORDER BY rowid DESC LIMIT ?1")?;
        let mut entries = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AuditEntry {
                    ts: row.get(0)?,
                    action: row.get(1)?,
                    detail: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read audit entries")?;
        entries.reverse();
        Ok(entries)
    }
}

enum AuditOp {
    Record(AuditAction, String),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking front of the audit store.
///
/// Entries are queued and written by a dedicated blocking task, so callers
/// may record while holding the ledger lock. Write failures are logged and
/// never reach the caller.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditOp>,
}

impl AuditLog {
    pub fn spawn(store: AuditStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditOp>();

        tokio::task::spawn_blocking(move || {
            while let Some(op) = rx.blocking_recv() {
                match op {
                    AuditOp::Record(action, detail) => {
                        if let Err(e) = store.append(action, &detail) {
                            tracing::error!("Failed to write audit entry {action}: {e:#}");
                        }
                    }
                    AuditOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    pub fn record(&self, action: AuditAction, detail: impl Into<String>) {
        if self.tx.send(AuditOp::Record(action, detail.into())).is_err() {
            tracing::warn!("Audit writer has stopped, dropping {action} entry");
        }
    }

    /// Wait until every entry recorded so far has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(AuditOp::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn create_test_store() -> (AuditStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = AuditStore::open(&temp_dir.path().join("nested/alloc_log.db")).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_action_names() {
        assert_eq!(AuditAction::Register.to_string(), "register");
        assert_eq!(AuditAction::from_str("steal").unwrap(), AuditAction::Steal);
    }

    #[test]
    fn test_append_and_read() {
        let (store, _temp) = create_test_store();
        store.append(AuditAction::Queue, "vm1|train need=4").unwrap();
        store.append(AuditAction::Assign, "vm1|train -> [0, 1, 2, 3]").unwrap();

        let entries = store.recent(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "queue");
        assert_eq!(entries[1].detail, "vm1|train -> [0, 1, 2, 3]");
        assert!(chrono::DateTime::parse_from_rfc3339(&entries[0].ts).is_ok());

        assert_eq!(store.recent(1).unwrap()[0].action, "assign");
    }

    #[tokio::test]
    async fn test_background_writer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("alloc_log.db");

        let log = AuditLog::spawn(AuditStore::open(&path).unwrap());
        log.record(AuditAction::Register, "vm1 0..4");
        log.record(AuditAction::Complete, "vm1|train");
        log.flush().await;

        let reader = AuditStore::open(&path).unwrap();
        let actions: Vec<_> = reader
            .recent(10)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["register", "complete"]);
    }
}
