mod backup;
mod blobstore;
mod config;
mod db;
mod dispatch;
mod hooks;
mod server;

use anyhow::{anyhow, Context, Result};
use backup::BackupService;
use blobstore::DirStore;
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use config::Config;
use db::{AuditEntry, Db};
use dispatch::Dispatcher;
use hooks::{HookContext, ServerHook};
use server::RconServer;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RunMode {
    /// Serve the command channel.
    Server,
    /// Submit a backup on a cron schedule; no command channel.
    Cron,
    /// Run a single backup to completion and exit.
    Once,
}

#[derive(Parser)]
#[command(author, version, about = "Backup daemon driven over an RCON-style command channel")]
struct Cli {
    /// Path to a YAML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = RunMode::Server)]
    mode: RunMode,

    /// Cron expression, required in cron mode.
    #[arg(long)]
    cron_schedule: Option<String>,

    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    password: Option<String>,

    /// Directory tree to back up.
    #[arg(long)]
    backup_dir: Option<PathBuf>,
    /// Root directory of the blob store.
    #[arg(long)]
    target_dir: Option<PathBuf>,
    /// Prefix for blob names.
    #[arg(long)]
    blob_prefix: Option<String>,
    /// Overwrite blobs that already exist.
    #[arg(short, long)]
    overwrite: bool,

    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Result<(Config, RunMode, Option<String>, bool)> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(host) = self.host {
            cfg.server.host = host;
        }
        if let Some(port) = self.port {
            cfg.server.port = port;
        }
        if let Some(password) = self.password {
            cfg.server.password = password;
        }
        if let Some(dir) = self.backup_dir {
            cfg.storage.backup_dir = dir;
        }
        if let Some(dir) = self.target_dir {
            cfg.storage.target_dir = dir;
        }
        if let Some(prefix) = self.blob_prefix {
            cfg.storage.blob_prefix = prefix;
        }
        if self.overwrite {
            cfg.storage.overwrite = true;
        }
        if let Some(path) = self.db_path {
            cfg.database.path = path;
        }

        Ok((cfg, self.mode, self.cron_schedule, self.verbose))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (cfg, mode, cron_schedule, verbose) = Cli::parse().into_config()?;
    setup_logging(&cfg.logging, verbose)?;
    log::info!("Starting blobvault-daemon...");

    if let Some(parent) = cfg.database.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Arc::new(Mutex::new(Db::new(&cfg.database.path)?));
    let store = Arc::new(DirStore::new(&cfg.storage.target_dir));
    let backups = BackupService::new(db.clone(), store, cfg.storage.clone());
    let stop_flag = Arc::new(AtomicBool::new(false));

    match mode {
        RunMode::Once => run_once(&db, &backups).await,
        RunMode::Cron => {
            let expr = cron_schedule
                .ok_or_else(|| anyhow!("--cron-schedule is required in cron mode"))?;
            run_cron(&backups, &expr, &stop_flag).await
        }
        RunMode::Server => run_server(cfg, db, backups, stop_flag).await,
    }
}

async fn run_server(
    cfg: Config,
    db: Arc<Mutex<Db>>,
    backups: BackupService,
    stop_flag: Arc<AtomicBool>,
) -> Result<()> {
    let dispatcher = Dispatcher::new(db.clone(), backups, stop_flag.clone());
    let mut server = RconServer::new(cfg.server, stop_flag.clone());

    // Connection and shutdown events go through the audit log without the
    // server loop knowing about the audit subsystem.
    let audit_db = db.clone();
    server.hooks_mut().register(ServerHook::PostAccept, move |_, ctx| {
        audit_connection_event(&audit_db, ctx, "client_connect", "Client connected");
    });
    let audit_db = db.clone();
    server.hooks_mut().register(ServerHook::ShutdownPre, move |_, ctx| {
        audit_connection_event(&audit_db, ctx, "shutdown", "Server stopping");
    });

    let sig_flag = stop_flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received interrupt, stopping server...");
            sig_flag.store(true, Ordering::SeqCst);
        }
    });

    // In-flight backup jobs are not joined on shutdown; a stop only ends the
    // accept loop.
    server.run(&dispatcher).await
}

fn audit_connection_event(db: &Mutex<Db>, ctx: &HookContext, function: &str, message: &str) {
    let entry = AuditEntry {
        function: function.to_string(),
        client: ctx
            .client_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default(),
        command: String::new(),
        status: true,
        message: Some(message.to_string()),
        backup_job_id: None,
    };
    if let Err(err) = db.lock().unwrap().log_audit(&entry) {
        log::error!("Failed to audit connection event: {:#}", err);
    }
}

/// Cron trigger: evaluates the schedule once per second and submits through
/// the same entry point the `backup` command uses.
async fn run_cron(backups: &BackupService, expr: &str, stop_flag: &AtomicBool) -> Result<()> {
    let schedule = cron::Schedule::from_str(expr)
        .map_err(|err| anyhow!("invalid cron expression {:?}: {}", expr, err))?;
    log::info!("Running in cron mode with schedule {:?}", expr);

    let mut last_run: Option<DateTime<Utc>> = None;
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    while !stop_flag.load(Ordering::SeqCst) {
        interval.tick().await;
        let now = Utc::now();
        let start = last_run.unwrap_or(now - chrono::Duration::seconds(1));
        let due = schedule
            .after(&start)
            .next()
            .map(|next| next <= now)
            .unwrap_or(false);
        if due {
            last_run = Some(now);
            match backups.submit("cron", "backup") {
                Ok(id) => log::info!("Scheduled backup job {}", id),
                Err(err) => log::error!("Failed to submit scheduled backup: {:#}", err),
            }
        }
    }
    Ok(())
}

/// One synchronous backup: submit, poll the registry until terminal, report.
async fn run_once(db: &Mutex<Db>, backups: &BackupService) -> Result<()> {
    let id = backups.submit("local", "backup")?;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let job = db
            .lock()
            .unwrap()
            .get_job(id)?
            .ok_or_else(|| anyhow!("backup job {} vanished from the registry", id))?;
        if job.status.is_terminal() {
            log::info!("Backup job {} finished: {} ({})", id, job.status, job.output);
            if job.status == common::JobStatus::Failed {
                std::process::exit(1);
            }
            return Ok(());
        }
    }
}

fn setup_logging(cfg: &config::LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        cfg.level.parse().unwrap_or(log::LevelFilter::Info)
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(path) = &cfg.file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}
