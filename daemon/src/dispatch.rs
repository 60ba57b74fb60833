use crate::backup::BackupService;
use crate::db::{AuditEntry, Db};
use common::{CommandType, Response, ServerCommand};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Maps parsed commands onto the registry and runner, producing exactly one
/// response per attempt. Every attempt, parseable or not, lands in the audit
/// log with the client address and the raw command text.
pub struct Dispatcher {
    db: Arc<Mutex<Db>>,
    backups: BackupService,
    stop_flag: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(db: Arc<Mutex<Db>>, backups: BackupService, stop_flag: Arc<AtomicBool>) -> Self {
        Self {
            db,
            backups,
            stop_flag,
        }
    }

    pub fn dispatch(&self, client: &str, line: &str) -> Response {
        log::info!("Processing command from {}: {}", client, line);

        let (response, job_id) = match ServerCommand::parse(line) {
            Ok(command) => self.execute(client, &command),
            Err(_) => (Response::error(format!("Unknown command: {}", line)), None),
        };

        let entry = AuditEntry {
            function: "process_command".to_string(),
            client: client.to_string(),
            command: line.to_string(),
            status: response.status,
            message: response.message.clone().or_else(|| response.error.clone()),
            backup_job_id: job_id,
        };
        if let Err(err) = self.db.lock().unwrap().log_audit(&entry) {
            log::error!("Failed to record audit entry: {:#}", err);
        }

        response
    }

    fn execute(&self, client: &str, command: &ServerCommand) -> (Response, Option<Uuid>) {
        match command.command_type {
            CommandType::Backup => match self.backups.submit(client, &command.to_string()) {
                Ok(id) => {
                    let mut data = Map::new();
                    data.insert("job_id".to_string(), Value::String(id.to_string()));
                    (Response::ok_with_data("Backup job started.", data), Some(id))
                }
                Err(err) => {
                    log::error!("Failed to start backup job: {:#}", err);
                    (
                        Response::error(format!("Failed to start backup job: {}", err)),
                        None,
                    )
                }
            },
            CommandType::BackupStatus => self.backup_status(command),
            CommandType::Stop => {
                log::info!("Stopping backup server...");
                self.stop_flag.store(true, Ordering::SeqCst);
                (Response::ok("Stopping backup server..."), None)
            }
        }
    }

    /// Unknown and malformed ids both get a negative response; lookups never
    /// bubble an error up to the connection layer.
    fn backup_status(&self, command: &ServerCommand) -> (Response, Option<Uuid>) {
        let id = command
            .args
            .first()
            .and_then(|arg| Uuid::parse_str(arg).ok());

        let job = match id {
            Some(id) => match self.db.lock().unwrap().get_job(id) {
                Ok(job) => job,
                Err(err) => {
                    log::error!("Backup job lookup failed: {:#}", err);
                    None
                }
            },
            None => None,
        };

        match job {
            Some(job) => {
                let id = job.id;
                let status = job.status.to_string();
                (Response::ok_with_data(status, job.to_data()), Some(id))
            }
            None => (
                Response::fail("Unable to find backup job using provided ID"),
                None,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::{BlobStore, PutOutcome};
    use crate::config::StorageConfig;
    use common::JobStatus;
    use std::time::Duration;

    struct NullStore;

    impl BlobStore for NullStore {
        fn put(&self, _name: &str, _data: &[u8], _overwrite: bool) -> anyhow::Result<PutOutcome> {
            Ok(PutOutcome::Written)
        }
    }

    fn make_dispatcher(backup_dir: &std::path::Path) -> (Dispatcher, Arc<Mutex<Db>>, Arc<AtomicBool>) {
        let db = Arc::new(Mutex::new(Db::open_in_memory().unwrap()));
        let storage = StorageConfig {
            backup_dir: backup_dir.to_path_buf(),
            ..Default::default()
        };
        let backups = BackupService::new(db.clone(), Arc::new(NullStore), storage);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let d = Dispatcher::new(db.clone(), backups, stop_flag.clone());
        (d, db, stop_flag)
    }

    #[tokio::test]
    async fn backup_returns_a_job_id_immediately() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), b"a").unwrap();
        let (dispatcher, db, _) = make_dispatcher(source.path());

        let resp = dispatcher.dispatch("127.0.0.1:1000", "backup");
        assert!(resp.status);
        assert_eq!(resp.message.as_deref(), Some("Backup job started."));

        let id: Uuid = resp.data.unwrap()["job_id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        // The row exists before the response goes out, whatever state the
        // runner has reached.
        assert!(db.lock().unwrap().get_job(id).unwrap().is_some());
    }

    #[tokio::test]
    async fn backup_status_reports_the_terminal_state() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), b"a").unwrap();
        let (dispatcher, db, _) = make_dispatcher(source.path());

        let resp = dispatcher.dispatch("client", "backup");
        let id = resp.data.unwrap()["job_id"].as_str().unwrap().to_string();

        for _ in 0..50 {
            let job = db
                .lock()
                .unwrap()
                .get_job(id.parse().unwrap())
                .unwrap()
                .unwrap();
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let resp = dispatcher.dispatch("client", &format!("backup-status {}", id));
        assert!(resp.status);
        assert_eq!(resp.message.as_deref(), Some(JobStatus::Completed.as_str()));
        assert_eq!(resp.data.unwrap()["id"], id);
    }

    #[tokio::test]
    async fn unknown_job_id_is_a_negative_response() {
        let source = tempfile::tempdir().unwrap();
        let (dispatcher, _, _) = make_dispatcher(source.path());

        for line in [
            format!("backup-status {}", Uuid::new_v4()),
            "backup-status not-a-uuid".to_string(),
            "backup-status".to_string(),
        ] {
            let resp = dispatcher.dispatch("client", &line);
            assert!(!resp.status);
            assert_eq!(
                resp.message.as_deref(),
                Some("Unable to find backup job using provided ID")
            );
            assert!(resp.data.is_none());
        }
    }

    #[tokio::test]
    async fn stop_sets_the_flag() {
        let source = tempfile::tempdir().unwrap();
        let (dispatcher, _, stop_flag) = make_dispatcher(source.path());

        let resp = dispatcher.dispatch("client", "stop");
        assert!(resp.status);
        assert_eq!(resp.message.as_deref(), Some("Stopping backup server..."));
        assert!(stop_flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unknown_command_is_reported_not_raised() {
        let source = tempfile::tempdir().unwrap();
        let (dispatcher, db, _) = make_dispatcher(source.path());

        let resp = dispatcher.dispatch("client", "frobnicate");
        assert!(!resp.status);
        assert_eq!(resp.error.as_deref(), Some("Unknown command: frobnicate"));

        // Even the invalid attempt is audited.
        let entries = db.lock().unwrap().audit_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command, "frobnicate");
        assert!(!entries[0].status);
        assert!(entries[0].backup_job_id.is_none());
    }

    #[tokio::test]
    async fn every_dispatch_is_audited_with_the_job_id() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), b"a").unwrap();
        let (dispatcher, db, _) = make_dispatcher(source.path());

        let resp = dispatcher.dispatch("10.0.0.9:999", "backup");
        let id: Uuid = resp.data.unwrap()["job_id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();

        let entries = db.lock().unwrap().audit_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].client, "10.0.0.9:999");
        assert_eq!(entries[0].backup_job_id, Some(id));
        assert!(entries[0].status);
    }
}
