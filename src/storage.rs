use crate::error::AppError;
use crate::models::{AuditEntry, Tier, UsageRecord, UserAccount};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Per-user documents backing the quota ledger and audit trail.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_usage(&self, uid: &str) -> Result<Option<UsageRecord>, AppError>;

    async fn put_usage(&self, uid: &str, record: &UsageRecord) -> Result<(), AppError>;

    async fn get_account(&self, uid: &str) -> Result<Option<UserAccount>, AppError>;

    /// Returns true when a new account was written; an existing one is never touched.
    async fn create_account_if_absent(
        &self,
        uid: &str,
        account: &UserAccount,
    ) -> Result<bool, AppError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError>;
}

/// SQLite-backed store. Every statement runs on tokio's blocking pool so a slow write
/// never parks a runtime worker.
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

fn parse_ts(idx: usize, raw: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        Self::from_connection(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AppError> {
        init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AppError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| AppError::Store("connection lock poisoned".into()))?;
            op(&guard)
        })
        .await
        .map_err(|e| AppError::Store(format!("store task failed: {e}")))?
    }

    pub async fn audit_entries(&self) -> Result<Vec<AuditEntry>, AppError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT uid, mode, provider, message, reply, created_at FROM audit_log ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], |r| {
                    Ok(AuditEntry {
                        uid: r.get(0)?,
                        mode: r.get(1)?,
                        provider: r.get(2)?,
                        message: r.get(3)?,
                        reply: r.get(4)?,
                        created_at: parse_ts(5, r.get(5)?)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn export_audit_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string_pretty(&self.audit_entries().await?)?)
    }
}

fn init(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS usage_documents (
            uid TEXT PRIMARY KEY,
            total_messages INTEGER NOT NULL,
            today_messages INTEGER NOT NULL,
            last_message_at TEXT,
            daily_reset_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS accounts (
            uid TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            tier TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY,
            uid TEXT NOT NULL,
            mode TEXT NOT NULL,
            provider TEXT NOT NULL,
            message TEXT NOT NULL,
            reply TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl DocumentStore for Storage {
    async fn get_usage(&self, uid: &str) -> Result<Option<UsageRecord>, AppError> {
        let uid = uid.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT total_messages, today_messages, last_message_at, daily_reset_at, updated_at
                     FROM usage_documents WHERE uid = ?",
                    [&uid],
                    |r| {
                        let last: Option<String> = r.get(2)?;
                        Ok(UsageRecord {
                            total_messages: r.get::<_, i64>(0)?.max(0) as u64,
                            today_messages: r.get::<_, i64>(1)?.max(0) as u64,
                            last_message_at: last.map(|raw| parse_ts(2, raw)).transpose()?,
                            daily_reset_at: parse_ts(3, r.get(3)?)?,
                            updated_at: parse_ts(4, r.get(4)?)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn put_usage(&self, uid: &str, record: &UsageRecord) -> Result<(), AppError> {
        let uid = uid.to_string();
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO usage_documents (uid, total_messages, today_messages, last_message_at, daily_reset_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(uid) DO UPDATE SET
                    total_messages = excluded.total_messages,
                    today_messages = excluded.today_messages,
                    last_message_at = excluded.last_message_at,
                    daily_reset_at = excluded.daily_reset_at,
                    updated_at = excluded.updated_at",
                params![
                    uid,
                    record.total_messages as i64,
                    record.today_messages as i64,
                    record.last_message_at.map(|t| t.to_rfc3339()),
                    record.daily_reset_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_account(&self, uid: &str) -> Result<Option<UserAccount>, AppError> {
        let uid = uid.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT created_at, tier FROM accounts WHERE uid = ?",
                    [&uid],
                    |r| {
                        Ok(UserAccount {
                            created_at: parse_ts(0, r.get(0)?)?,
                            tier: Tier::parse(&r.get::<_, String>(1)?),
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn create_account_if_absent(
        &self,
        uid: &str,
        account: &UserAccount,
    ) -> Result<bool, AppError> {
        let uid = uid.to_string();
        let created_at = account.created_at.to_rfc3339();
        let tier = account.tier.as_label();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO accounts (uid, created_at, tier) VALUES (?1, ?2, ?3)
                 ON CONFLICT(uid) DO NOTHING",
                params![uid, created_at, tier],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), AppError> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (uid, mode, provider, message, reply, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.uid,
                    entry.mode,
                    entry.provider,
                    entry.message,
                    entry.reply,
                    entry.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}
