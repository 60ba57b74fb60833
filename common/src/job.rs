use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a backup job. Transitions are monotonic: a job starts
/// `InProgress` and moves exactly once to `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "InProgress",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InProgress" => Ok(JobStatus::InProgress),
            "Completed" => Ok(JobStatus::Completed),
            "Failed" => Ok(JobStatus::Failed),
            other => Err(anyhow::anyhow!("unrecognized job status: {}", other)),
        }
    }
}

/// One tracked backup job. Rows are permanent history: created when a backup
/// command is accepted, updated once with the terminal status, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: Uuid,
    pub client: String,
    pub command: String,
    pub status: JobStatus,
    pub output: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackupJob {
    pub fn new(client: &str, command: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client: client.to_string(),
            command: command.to_string(),
            status: JobStatus::InProgress,
            output: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Field map used as the `data` member of a status response.
    pub fn to_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("id".to_string(), Value::String(self.id.to_string()));
        data.insert("client".to_string(), Value::String(self.client.clone()));
        data.insert("command".to_string(), Value::String(self.command.clone()));
        data.insert(
            "status".to_string(),
            Value::String(self.status.to_string()),
        );
        data.insert("output".to_string(), Value::String(self.output.clone()));
        data.insert(
            "created_at".to_string(),
            Value::String(self.created_at.to_rfc3339()),
        );
        data.insert(
            "updated_at".to_string(),
            Value::String(self.updated_at.to_rfc3339()),
        );
        data
    }
}
