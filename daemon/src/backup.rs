use crate::blobstore::{BlobStore, PutOutcome};
use crate::config::StorageConfig;
use crate::db::Db;
use anyhow::Result;
use chrono::{DateTime, Utc};
use common::{BackupJob, JobStatus};
use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use walkdir::WalkDir;

/// Terminal failure of one backup walk. The three variants deliberately keep
/// the original tool's asymmetric handling: a missing source directory fails
/// the job quietly, everything else fails the job and is also returned to the
/// runner task that drove the walk.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup source {0} does not exist")]
    MissingSource(PathBuf),
    #[error("{failed} file(s) failed to upload, last error: {last:#}")]
    UploadPartial { failed: usize, last: anyhow::Error },
    #[error("backup walk failed: {0:#}")]
    Unexpected(anyhow::Error),
}

#[derive(Debug, Default)]
struct WalkStats {
    uploaded: usize,
    skipped: usize,
}

/// Submits backup jobs and runs each one on its own fire-and-forget task.
///
/// Tasks are unbounded by design: every accepted `backup` command gets a
/// runner immediately, with no pool or queue. In-flight runners are tracked
/// in `running` (job id -> start time) so they can be counted, but shutdown
/// neither joins nor cancels them.
#[derive(Clone)]
pub struct BackupService {
    db: Arc<Mutex<Db>>,
    store: Arc<dyn BlobStore>,
    storage: StorageConfig,
    running: Arc<DashMap<Uuid, DateTime<Utc>>>,
}

impl BackupService {
    pub fn new(db: Arc<Mutex<Db>>, store: Arc<dyn BlobStore>, storage: StorageConfig) -> Self {
        Self {
            db,
            store,
            storage,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Creates the job row and starts its runner. Returns as soon as the row
    /// exists; completion is observed through `backup-status`. This is the
    /// single entry point for both the command channel and the cron trigger.
    pub fn submit(&self, client: &str, command: &str) -> Result<Uuid> {
        let job = BackupJob::new(client, command);
        self.db.lock().unwrap().insert_job(&job)?;
        let id = job.id;

        self.running.insert(id, Utc::now());
        log::info!(
            "Backup job {} submitted by {} ({} in flight)",
            id,
            client,
            self.running.len()
        );

        let db = self.db.clone();
        let store = self.store.clone();
        let storage = self.storage.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            // The walk is plain blocking fs work.
            let result =
                tokio::task::spawn_blocking(move || run_backup(&db, id, &storage, store.as_ref()))
                    .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::error!("Backup job {} aborted: {:#}", id, err),
                Err(err) => log::error!("Backup job {} panicked: {}", id, err),
            }
            running.remove(&id);
        });

        Ok(id)
    }

    pub fn in_flight(&self) -> usize {
        self.running.len()
    }
}

/// Drives one job to its terminal status. `MissingSource` is swallowed here
/// after marking the job `Failed`; any other walk failure marks the job and
/// is returned so the task wrapper can log it.
fn run_backup(
    db: &Mutex<Db>,
    id: Uuid,
    storage: &StorageConfig,
    store: &dyn BlobStore,
) -> Result<()> {
    log::info!(
        "Backup job {} walking {}...",
        id,
        storage.backup_dir.display()
    );

    match walk_and_upload(storage, store) {
        Ok(stats) => {
            let message = format!(
                "Backup completed. {} file(s) uploaded, {} skipped.",
                stats.uploaded, stats.skipped
            );
            log::info!("Backup job {}: {}", id, message);
            db.lock().unwrap().update_job_status(id, JobStatus::Completed, &message)?;
            Ok(())
        }
        Err(err @ BackupError::MissingSource(_)) => {
            log::error!("Backup job {}: {}", id, err);
            db.lock()
                .unwrap()
                .update_job_status(id, JobStatus::Failed, &err.to_string())?;
            Ok(())
        }
        Err(err) => {
            log::error!("Backup job {}: {}", id, err);
            db.lock()
                .unwrap()
                .update_job_status(id, JobStatus::Failed, &err.to_string())?;
            Err(err.into())
        }
    }
}

fn walk_and_upload(storage: &StorageConfig, store: &dyn BlobStore) -> Result<WalkStats, BackupError> {
    match fs::metadata(&storage.backup_dir) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(BackupError::MissingSource(storage.backup_dir.clone()));
        }
        Err(err) => return Err(BackupError::Unexpected(err.into())),
        Ok(meta) if !meta.is_dir() => {
            return Err(BackupError::MissingSource(storage.backup_dir.clone()));
        }
        Ok(_) => {}
    }

    let mut stats = WalkStats::default();
    let mut failed = 0;
    let mut last_err = None;

    for entry in WalkDir::new(&storage.backup_dir) {
        let entry = entry.map_err(|err| BackupError::Unexpected(err.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(&storage.backup_dir)
            .map_err(|err| BackupError::Unexpected(err.into()))?;
        let blob_name = blob_name(&storage.blob_prefix, rel);

        log::debug!(
            "Found file {}, uploading as blob {}...",
            entry.path().display(),
            blob_name
        );
        match upload_file(entry.path(), &blob_name, storage.overwrite, store) {
            Ok(PutOutcome::Written) => stats.uploaded += 1,
            Ok(PutOutcome::AlreadyExists) => {
                log::info!("Blob {} already exists, skipping upload", blob_name);
                stats.skipped += 1;
            }
            // One bad file must not stop the rest of the walk.
            Err(err) => {
                log::error!("Failed to upload {}: {:#}", entry.path().display(), err);
                failed += 1;
                last_err = Some(err);
            }
        }
    }

    match last_err {
        Some(last) => Err(BackupError::UploadPartial { failed, last }),
        None => Ok(stats),
    }
}

fn upload_file(
    path: &Path,
    blob_name: &str,
    overwrite: bool,
    store: &dyn BlobStore,
) -> Result<PutOutcome> {
    let data = fs::read(path)?;
    store.put(blob_name, &data, overwrite)
}

fn blob_name(prefix: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy();
    if prefix.is_empty() {
        rel.into_owned()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    /// In-memory store, optionally failing puts for one blob name.
    #[derive(Default)]
    struct MemStore {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
        fail_on: Option<String>,
    }

    impl MemStore {
        fn failing_on(name: &str) -> Self {
            Self {
                fail_on: Some(name.to_string()),
                ..Default::default()
            }
        }

        fn get(&self, name: &str) -> Option<Vec<u8>> {
            self.blobs.lock().unwrap().get(name).cloned()
        }

        fn insert(&self, name: &str, data: &[u8]) {
            self.blobs.lock().unwrap().insert(name.to_string(), data.to_vec());
        }
    }

    impl BlobStore for MemStore {
        fn put(&self, name: &str, data: &[u8], overwrite: bool) -> Result<PutOutcome> {
            if self.fail_on.as_deref() == Some(name) {
                anyhow::bail!("injected failure for {}", name);
            }
            let mut blobs = self.blobs.lock().unwrap();
            if !overwrite && blobs.contains_key(name) {
                return Ok(PutOutcome::AlreadyExists);
            }
            blobs.insert(name.to_string(), data.to_vec());
            Ok(PutOutcome::Written)
        }
    }

    fn storage_for(dir: &Path) -> StorageConfig {
        StorageConfig {
            backup_dir: dir.to_path_buf(),
            target_dir: PathBuf::from("/unused"),
            blob_prefix: "world".to_string(),
            overwrite: false,
        }
    }

    fn seed_source() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("level.dat"), b"level").unwrap();
        fs::create_dir_all(dir.path().join("region")).unwrap();
        fs::write(dir.path().join("region/r.0.0.mca"), b"chunks").unwrap();
        dir
    }

    fn submitted_job(db: &Arc<Mutex<Db>>) -> Uuid {
        let job = BackupJob::new("test", "backup");
        db.lock().unwrap().insert_job(&job).unwrap();
        job.id
    }

    #[test]
    fn completed_walk_stores_every_file_under_the_prefix() {
        let source = seed_source();
        let db = Arc::new(Mutex::new(Db::open_in_memory().unwrap()));
        let store = MemStore::default();
        let id = submitted_job(&db);

        run_backup(&db, id, &storage_for(source.path()), &store).unwrap();

        assert_eq!(store.get("world/level.dat").unwrap(), b"level");
        assert_eq!(store.get("world/region/r.0.0.mca").unwrap(), b"chunks");
        let job = db.lock().unwrap().get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.output.contains("2 file(s) uploaded"));
    }

    #[test]
    fn missing_source_fails_the_job_without_raising() {
        let db = Arc::new(Mutex::new(Db::open_in_memory().unwrap()));
        let store = MemStore::default();
        let id = submitted_job(&db);
        let storage = storage_for(Path::new("/no/such/directory"));

        // The error class is swallowed: run_backup itself reports success.
        run_backup(&db, id, &storage, &store).unwrap();

        let job = db.lock().unwrap().get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.output.contains("/no/such/directory"));
    }

    #[test]
    fn existing_blobs_are_skipped_when_not_overwriting() {
        let source = seed_source();
        let db = Arc::new(Mutex::new(Db::open_in_memory().unwrap()));
        let store = MemStore::default();
        store.insert("world/level.dat", b"previous");
        let id = submitted_job(&db);

        run_backup(&db, id, &storage_for(source.path()), &store).unwrap();

        // The stale copy survives; only the new file was written.
        assert_eq!(store.get("world/level.dat").unwrap(), b"previous");
        assert_eq!(store.get("world/region/r.0.0.mca").unwrap(), b"chunks");
        let job = db.lock().unwrap().get_job(id).unwrap().unwrap();
        assert!(job.output.contains("1 file(s) uploaded, 1 skipped"));
    }

    #[test]
    fn one_bad_file_does_not_stop_the_rest() {
        let source = seed_source();
        let db = Arc::new(Mutex::new(Db::open_in_memory().unwrap()));
        let store = MemStore::failing_on("world/level.dat");
        let id = submitted_job(&db);

        let err = run_backup(&db, id, &storage_for(source.path()), &store).unwrap_err();
        assert!(err.to_string().contains("1 file(s) failed"));

        // The healthy file still made it, and the job is Failed exactly once.
        assert_eq!(store.get("world/region/r.0.0.mca").unwrap(), b"chunks");
        let job = db.lock().unwrap().get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_submits_yield_distinct_ids() {
        let source = seed_source();
        let db = Arc::new(Mutex::new(Db::open_in_memory().unwrap()));
        let service = Arc::new(BackupService::new(
            db.clone(),
            Arc::new(MemStore::default()),
            storage_for(source.path()),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = service.clone();
            handles.push(tokio::spawn(async move { service.submit("test", "backup") }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 16);

        // Every job settles on exactly one terminal status.
        for _ in 0..50 {
            if service.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for id in ids {
            let job = db.lock().unwrap().get_job(id).unwrap().unwrap();
            assert!(job.status.is_terminal());
        }
    }
}
