pub mod command;
pub mod job;
pub mod packet;
pub mod response;

pub use command::{CommandType, ServerCommand};
pub use job::{BackupJob, JobStatus};
pub use packet::{Packet, PacketError, PacketKind};
pub use response::Response;

// Production defaults
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 65432;
pub const DEFAULT_DB_PATH: &str = "/var/lib/blobvault/blobvault.db";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/blobvault/config.yaml";
pub const DEFAULT_LOG_FILE: &str = "/var/log/blobvault/daemon.log";
pub const DEFAULT_BLOB_DIR: &str = "/var/lib/blobvault/blobs";
pub const DEFAULT_BACKUP_DIR: &str = "/backups";
