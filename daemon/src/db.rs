use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use common::{BackupJob, JobStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

/// One audit row per dispatch attempt, valid command or not. Append-only.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub function: String,
    pub client: String,
    pub command: String,
    pub status: bool,
    pub message: Option<String>,
    pub backup_job_id: Option<Uuid>,
}

/// Sqlite-backed job registry and audit sink. Shared across connections and
/// job runners as `Arc<Mutex<Db>>`; the connection mutex is what serializes
/// status writes, so readers never observe a torn status.
pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn new(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS backup_jobs (
                id TEXT PRIMARY KEY,
                client TEXT NOT NULL,
                command TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log_entries (
                id INTEGER PRIMARY KEY,
                function TEXT NOT NULL,
                client TEXT NOT NULL,
                command TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                backup_job_id TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self { conn })
    }

    pub fn insert_job(&self, job: &BackupJob) -> Result<()> {
        self.conn.execute(
            "INSERT INTO backup_jobs (id, client, command, status, output, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id.to_string(),
                job.client,
                job.command,
                job.status.as_str(),
                job.output,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Moves a job to its terminal status. A single guarded UPDATE: only an
    /// `InProgress` row can change, which keeps the transition monotonic even
    /// if two writers race.
    pub fn update_job_status(&self, id: Uuid, status: JobStatus, output: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE backup_jobs SET status = ?2, output = ?3, updated_at = ?4
             WHERE id = ?1 AND status = ?5",
            params![
                id.to_string(),
                status.as_str(),
                output,
                Utc::now(),
                JobStatus::InProgress.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<BackupJob>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, client, command, status, output, created_at, updated_at
             FROM backup_jobs WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, DateTime<Utc>>(5)?,
                    row.get::<_, DateTime<Utc>>(6)?,
                ))
            })
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, client, command, status, output, created_at, updated_at)) => {
                Ok(Some(BackupJob {
                    id: Uuid::parse_str(&id)?,
                    client,
                    command,
                    status: status
                        .parse()
                        .map_err(|_| anyhow!("corrupt status column: {}", status))?,
                    output,
                    created_at,
                    updated_at,
                }))
            }
        }
    }

    pub fn log_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audit_log_entries (function, client, command, status, message, backup_job_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.function,
                entry.client,
                entry.command,
                if entry.status { "success" } else { "failure" },
                entry.message,
                entry.backup_job_id.map(|id| id.to_string()),
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT function, client, command, status, message, backup_job_id
             FROM audit_log_entries ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (function, client, command, status, message, job_id) = row?;
            entries.push(AuditEntry {
                function,
                client,
                command,
                status: status == "success",
                message,
                backup_job_id: job_id.map(|s| Uuid::parse_str(&s)).transpose()?,
            });
        }
        Ok(entries)
    }
}
