use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::hooks::{HookContext, HookRegistry, ServerHook};
use anyhow::{bail, Result};
use common::packet::{self, IDENT_FAILURE, IDENT_SUCCESS};
use common::{Packet, PacketKind, Response};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// The RCON-style command server.
///
/// Connections are served strictly one at a time: a client's whole exchange
/// (auth, one command, one reply) finishes before the next accept. The backup
/// jobs a connection spawns keep running on their own tasks regardless.
pub struct RconServer {
    config: ServerConfig,
    stop_flag: Arc<AtomicBool>,
    hooks: HookRegistry,
}

impl RconServer {
    pub fn new(config: ServerConfig, stop_flag: Arc<AtomicBool>) -> Self {
        Self {
            config,
            stop_flag,
            hooks: HookRegistry::new(),
        }
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub async fn run(&self, dispatcher: &Dispatcher) -> Result<()> {
        self.hooks.run(ServerHook::StartupPre, &HookContext::default());
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        log::info!("Server started at {}", listener.local_addr()?);
        self.hooks.run(ServerHook::StartupPost, &HookContext::default());
        self.serve(listener, dispatcher).await
    }

    /// Accept loop. The timeout bounds each accept so the stop flag is
    /// polled between connections; an exchange in progress is never cut off.
    pub async fn serve(&self, listener: TcpListener, dispatcher: &Dispatcher) -> Result<()> {
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                // Runs as soon as the stop request is observed, while the
                // listening socket is still open.
                self.hooks.run(ServerHook::ShutdownPre, &HookContext::default());
                break;
            }
            self.hooks.run(ServerHook::PreAccept, &HookContext::default());
            log::debug!("Waiting for connection...");

            let (socket, peer) = match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
                Err(_) => continue,
                Ok(Err(err)) => {
                    log::error!("Failed to accept connection: {}", err);
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };

            self.hooks.run(
                ServerHook::PostAccept,
                &HookContext {
                    client_addr: Some(peer),
                },
            );
            log::info!("Connection from {}", peer);

            if let Err(err) = self.process_client(socket, peer, dispatcher).await {
                // Protocol and auth failures are local to the connection.
                log::warn!("Connection from {} ended with error: {:#}", peer, err);
            }
        }

        log::info!("Stopping server socket...");
        drop(listener);
        log::info!("Server stopped");
        self.hooks.run(ServerHook::ShutdownPost, &HookContext::default());
        Ok(())
    }

    /// Drives one connection: auth handshake, one command, one reply, close.
    async fn process_client(
        &self,
        mut socket: TcpStream,
        peer: SocketAddr,
        dispatcher: &Dispatcher,
    ) -> Result<()> {
        let request = packet::read_packet(&mut socket).await?;
        log::debug!("Request decoded: {:?}", request);

        if request.kind != PacketKind::Auth {
            bail!("expected auth packet, got {:?}", request.kind);
        }

        let accepted = self.config.password.is_empty()
            || request.payload == self.config.password.as_bytes();
        if !accepted {
            log::info!("Sending password rejected message to {}", peer);
            let reply = Packet::new(
                IDENT_FAILURE,
                PacketKind::Auth,
                Response::fail("Password rejected!").to_json(),
            );
            packet::write_packet(&mut socket, &reply).await?;
            return Ok(());
        }

        log::debug!("Sending password accepted message to {}", peer);
        let reply = Packet::new(
            IDENT_SUCCESS,
            PacketKind::Auth,
            Response::ok("Password accepted!").to_json(),
        );
        packet::write_packet(&mut socket, &reply).await?;

        let request = packet::read_packet(&mut socket).await?;
        log::debug!("Request decoded: {:?}", request);
        if request.kind != PacketKind::Command {
            bail!("expected command packet, got {:?}", request.kind);
        }

        let line = String::from_utf8_lossy(&request.payload).trim().to_string();
        let response = dispatcher.dispatch(&peer.to_string(), &line);
        let ident = if response.status {
            IDENT_SUCCESS
        } else {
            IDENT_FAILURE
        };
        let reply = Packet::new(ident, PacketKind::Command, response.to_json());
        packet::write_packet(&mut socket, &reply).await?;

        log::info!("Stopping connection from {}", peer);
        Ok(())
    }
}
