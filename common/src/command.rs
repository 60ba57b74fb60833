use anyhow::bail;
use std::fmt;

/// The commands a client can send over the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Backup,
    BackupStatus,
    Stop,
}

impl CommandType {
    pub fn label(&self) -> &'static str {
        match self {
            CommandType::Backup => "backup",
            CommandType::BackupStatus => "backup-status",
            CommandType::Stop => "stop",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A parsed command line: `<verb> [args...]`, split on whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub command_type: CommandType,
    pub args: Vec<String>,
}

impl ServerCommand {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let command_type = match verb {
            "backup" => CommandType::Backup,
            "backup-status" => CommandType::BackupStatus,
            "stop" => CommandType::Stop,
            _ => bail!("unknown command: {}", line),
        };
        Ok(Self {
            command_type,
            args: parts.map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_type)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
