use clap::Parser;
use common::packet::{self, IDENT_SUCCESS};
use common::{Packet, PacketKind, Response};
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(author, version, about = "Send a command to a running blobvault daemon")]
struct Cli {
    #[arg(long, default_value = common::DEFAULT_HOST)]
    host: String,
    #[arg(long, default_value_t = common::DEFAULT_PORT)]
    port: u16,
    #[arg(long, default_value = "")]
    password: String,
    /// Command to send, e.g. `backup`, `backup-status <id>`, `stop`
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut stream = TcpStream::connect((cli.host.as_str(), cli.port)).await?;

    let auth = Packet::new(0, PacketKind::Auth, cli.password.into_bytes());
    packet::write_packet(&mut stream, &auth).await?;
    let reply = packet::read_packet(&mut stream).await?;
    if reply.ident != IDENT_SUCCESS {
        let resp: Response = serde_json::from_slice(&reply.payload)?;
        eprintln!(
            "Authentication failed: {}",
            resp.message.unwrap_or_else(|| "no reason given".to_string())
        );
        std::process::exit(1);
    }

    let line = cli.command.join(" ");
    let command = Packet::new(0, PacketKind::Command, line.into_bytes());
    packet::write_packet(&mut stream, &command).await?;
    let reply = packet::read_packet(&mut stream).await?;

    let resp: Response = serde_json::from_slice(&reply.payload)?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    if !resp.status {
        std::process::exit(1);
    }
    Ok(())
}
