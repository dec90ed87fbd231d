//! GDB RSP server: accepts one client at a time and drives its session

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::command::Command;
use super::connection::{GdbConnection, Incoming};
use super::response::Response;
use super::session::{error_code, DebugSession, SessionError};
use crate::controller::{TargetControllerError, TargetControllerService, TargetControllerState};
use crate::error::{DebugError, Result};
use crate::events::{EventBus, EventListener};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GdbServerConfig {
    pub listen_address: String,
    pub port: u16,
    /// Advertised in `qSupported`; also bounds inbound packets
    pub packet_size: usize,
    pub halt_on_connect: bool,
    pub resume_on_disconnect: bool,
}

impl Default for GdbServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 1442,
            packet_size: 4096,
            halt_on_connect: true,
            resume_on_disconnect: false,
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Shutdown,
    ControllerStopped,
}

enum Activity {
    Shutdown,
    Event(Option<std::sync::Arc<crate::events::Event>>),
    Bytes(std::io::Result<Vec<u8>>),
}

pub struct GdbRspServer {
    config: GdbServerConfig,
    service: TargetControllerService,
    events: EventBus,
}

impl GdbRspServer {
    pub fn new(
        config: GdbServerConfig,
        service: TargetControllerService,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            service,
            events,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let address = format!("{}:{}", self.config.listen_address, self.config.port);
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            DebugError::ConnectionFailed(format!("Failed to listen on {}: {}", address, e))
        })?;
        Ok(listener)
    }

    /// Bind the configured address and serve until `shutdown` turns true
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve clients one at a time. Ends with an error if the target controller stops.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if let Ok(address) = listener.local_addr() {
            info!("GDB server listening on {}", address);
        }

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = shutdown.changed() => {
                    info!("GDB server shutting down");
                    return Ok(());
                }
            };

            let (stream, peer) = match accepted {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Failed to accept GDB connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY: {}", e);
            }

            match self.handle_client(stream, peer, &mut shutdown).await {
                SessionEnd::Closed => continue,
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::ControllerStopped => {
                    error!("Target controller stopped, GDB server exiting");
                    return Err(DebugError::ControllerUnavailable);
                }
            }
        }
    }

    async fn handle_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        if self.service.controller_state() == TargetControllerState::Stopped {
            return SessionEnd::ControllerStopped;
        }

        let descriptor = match self.service.get_target_descriptor().await {
            Ok(descriptor) => descriptor,
            Err(TargetControllerError::ControllerUnavailable) => {
                return SessionEnd::ControllerStopped
            }
            Err(e) => {
                warn!("Rejecting GDB client {}: {}", peer, e);
                return SessionEnd::Closed;
            }
        };

        let mut listener = self.events.subscribe("gdb-session");
        let mut session = DebugSession::new(descriptor, self.config.packet_size);
        info!(
            "GDB client connected from {} (session {}, target {})",
            peer,
            session.id(),
            session.descriptor().name
        );

        if self.config.halt_on_connect {
            match self.service.stop_execution().await {
                Ok(()) => {}
                Err(TargetControllerError::ControllerUnavailable) => {
                    return SessionEnd::ControllerStopped
                }
                Err(e) => warn!("Failed to halt target on connect: {}", e),
            }
        }

        let mut connection = GdbConnection::new(stream, self.config.packet_size);
        let end = match self
            .drive(&mut session, &mut connection, &mut listener, shutdown)
            .await
        {
            Ok(end) => end,
            Err(SessionError::ControllerUnavailable) => SessionEnd::ControllerStopped,
            Err(SessionError::ClientNotSupported) => {
                warn!("GDB client {} does not support breakpoints, closing session", peer);
                SessionEnd::Closed
            }
            Err(SessionError::Io(e)) => {
                info!("GDB connection from {} lost: {}", peer, e);
                SessionEnd::Closed
            }
        };

        if end != SessionEnd::ControllerStopped {
            session
                .terminate(&self.service, self.config.resume_on_disconnect)
                .await;
        }
        end
    }

    async fn drive<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        session: &mut DebugSession,
        connection: &mut GdbConnection<S>,
        listener: &mut EventListener,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::result::Result<SessionEnd, SessionError> {
        loop {
            // Events queued before a packet are handled first so stale stops never
            // answer a later resume
            let activity = tokio::select! {
                biased;
                _ = shutdown.changed() => Activity::Shutdown,
                event = listener.recv() => Activity::Event(event),
                bytes = connection.read_chunk() => Activity::Bytes(bytes),
            };

            match activity {
                Activity::Shutdown => return Ok(SessionEnd::Shutdown),
                Activity::Event(None) => return Ok(SessionEnd::Shutdown),
                Activity::Event(Some(event)) => {
                    if event.is_controller_stopped() {
                        warn!("Target controller stopped, ending GDB session {}", session.id());
                        return Ok(SessionEnd::ControllerStopped);
                    }
                    if let Some(response) = session.on_event(&event) {
                        connection.write_response(&response).await?;
                    }
                }
                Activity::Bytes(bytes) => {
                    let bytes = bytes?;
                    if bytes.is_empty() {
                        info!("GDB client disconnected (session {})", session.id());
                        return Ok(SessionEnd::Closed);
                    }

                    let incoming = connection.process(&bytes).await?;
                    // Interrupts bypass packets received in the same read
                    let (interrupts, packets): (Vec<_>, Vec<_>) = incoming
                        .into_iter()
                        .partition(|i| matches!(i, Incoming::Interrupt));

                    for _ in interrupts {
                        let end = self.dispatch(session, connection, Command::Interrupt).await?;
                        if let Some(end) = end {
                            return Ok(end);
                        }
                    }
                    for packet in packets {
                        let Incoming::Packet(payload) = packet else {
                            continue;
                        };
                        let command = match Command::parse(&payload) {
                            Ok(command) => command,
                            Err(e) => {
                                debug!("Malformed command: {}", e);
                                connection
                                    .write_response(&Response::Error(error_code::INVALID))
                                    .await?;
                                continue;
                            }
                        };
                        if let Some(end) = self.dispatch(session, connection, command).await? {
                            return Ok(end);
                        }
                    }
                }
            }
        }
    }

    async fn dispatch<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        session: &mut DebugSession,
        connection: &mut GdbConnection<S>,
        command: Command,
    ) -> std::result::Result<Option<SessionEnd>, SessionError> {
        debug!("Handling {:?}", command);
        if let Some(response) = session.handle(&command, &self.service).await? {
            connection.write_response(&response).await?;
        }

        match command {
            Command::StartNoAckMode => connection.disable_acks(),
            Command::Detach => {
                info!("GDB client detached (session {})", session.id());
                return Ok(Some(SessionEnd::Closed));
            }
            Command::Kill => {
                info!("GDB client killed the session {}", session.id());
                return Ok(Some(SessionEnd::Closed));
            }
            _ => {}
        }
        Ok(None)
    }
}
