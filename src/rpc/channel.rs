use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use prost::Message;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::connection::{
    Connection, ConnectionId, NetEvent, ResponseCallback, CLIENT_CONNECTION_ID,
};
use super::service::{CallContext, ServiceRegistry};
use crate::config::RpcConfig;
use crate::error::{DistbuildError, Result};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Notified by the RPC loop as connections come and go.
///
/// Observers run on the RPC loop, in registration order.
pub trait ConnectionObserver: Send {
    fn on_connect(&mut self, connection: &Connection, rpc: &RpcHandle);
    fn on_close(&mut self, connection: ConnectionId);
}

pub(crate) enum NetCommand {
    Call {
        connection: ConnectionId,
        service: String,
        method: String,
        payload: Vec<u8>,
        on_response: ResponseCallback,
    },
    Respond {
        connection: ConnectionId,
        id: u32,
        service: String,
        method: String,
        payload: Vec<u8>,
    },
    Close {
        connection: ConnectionId,
    },
    Connect {
        addr: SocketAddr,
        done: oneshot::Sender<Result<ConnectionId>>,
    },
    Connected {
        stream: TcpStream,
        peer: SocketAddr,
        done: oneshot::Sender<Result<ConnectionId>>,
    },
}

/// Cloneable entry point into a running [`RpcChannel`].
#[derive(Clone)]
pub struct RpcHandle {
    commands: mpsc::UnboundedSender<NetCommand>,
}

impl RpcHandle {
    /// Sends a typed request. `on_response` runs on the RPC loop when the
    /// matching response arrives, and never if the connection closes first.
    pub fn call<Req, Resp, F>(
        &self,
        connection: ConnectionId,
        service: &str,
        method: &str,
        request: &Req,
        on_response: F,
    ) -> Result<()>
    where
        Req: Message,
        Resp: Message + Default,
        F: FnOnce(ConnectionId, Resp) + Send + 'static,
    {
        let method_name = method.to_string();
        let callback: ResponseCallback =
            Box::new(move |connection, payload| match Resp::decode(payload.as_slice()) {
                Ok(response) => on_response(connection, response),
                Err(e) => {
                    tracing::warn!(connection, method = %method_name, error = %e, "Undecodable response")
                }
            });
        self.send(NetCommand::Call {
            connection,
            service: service.to_string(),
            method: method.to_string(),
            payload: request.encode_to_vec(),
            on_response: callback,
        })
    }

    pub(crate) fn respond(
        &self,
        connection: ConnectionId,
        id: u32,
        service: String,
        method: String,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.send(NetCommand::Respond {
            connection,
            id,
            service,
            method,
            payload,
        })
    }

    pub fn close(&self, connection: ConnectionId) -> Result<()> {
        self.send(NetCommand::Close { connection })
    }

    /// Opens the client link to `addr`, resolving once it is registered.
    pub async fn connect(&self, addr: SocketAddr) -> Result<ConnectionId> {
        let (done, rx) = oneshot::channel();
        self.send(NetCommand::Connect { addr, done })?;
        rx.await.map_err(|_| DistbuildError::ChannelClosed)?
    }

    fn send(&self, command: NetCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| DistbuildError::ChannelClosed)
    }
}

/// The network loop: owns the listening socket, every [`Connection`], the
/// [`ServiceRegistry`] and the connection observers.
pub struct RpcChannel {
    config: RpcConfig,
    registry: ServiceRegistry,
    observers: Vec<Box<dyn ConnectionObserver>>,
    connections: HashMap<ConnectionId, Connection>,
    listener: Option<TcpListener>,
    last_id: ConnectionId,
    handle: RpcHandle,
    commands: mpsc::UnboundedReceiver<NetCommand>,
    events_tx: mpsc::UnboundedSender<NetEvent>,
    events: mpsc::UnboundedReceiver<NetEvent>,
    shutdown: CancellationToken,
}

impl RpcChannel {
    pub fn new(config: RpcConfig, registry: ServiceRegistry, shutdown: CancellationToken) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            observers: Vec::new(),
            connections: HashMap::new(),
            listener: None,
            last_id: CLIENT_CONNECTION_ID,
            handle: RpcHandle {
                commands: commands_tx,
            },
            commands,
            events_tx,
            events,
            shutdown,
        }
    }

    pub fn handle(&self) -> RpcHandle {
        self.handle.clone()
    }

    pub fn add_observer(&mut self, observer: Box<dyn ConnectionObserver>) {
        self.observers.push(observer);
    }

    pub fn registry_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.registry
    }

    /// Binds the server socket. Accepting starts once [`run`](Self::run) is
    /// polled. Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr, backlog: u32) -> Result<SocketAddr> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(backlog)?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "RPC server listening");
        self.listener = Some(listener);
        Ok(local)
    }

    pub fn find_connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub async fn run(mut self) {
        let mut accept_failures = 0u32;
        let mut accept_paused_until: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(accept_paused_until.unwrap_or_else(Instant::now)),
                    if accept_paused_until.is_some() => accept_paused_until = None,
                accepted = accept(self.listener.as_ref()), if accept_paused_until.is_none() => match accepted {
                    Ok((stream, peer)) => {
                        accept_failures = 0;
                        self.last_id += 1;
                        let id = self.last_id;
                        self.register(id, stream, peer);
                    }
                    Err(e) => {
                        accept_failures = accept_failures.saturating_add(1);
                        let delay = accept_backoff(accept_failures);
                        tracing::warn!(
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Accept failed"
                        );
                        accept_paused_until = Some(Instant::now() + delay);
                    }
                },
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }

        // Responses posted before shutdown still reach their sockets.
        while let Ok(command) = self.commands.try_recv() {
            if let NetCommand::Respond { .. } = command {
                self.handle_command(command);
            }
        }
        for connection in self.connections.values_mut() {
            connection.close();
        }
        tracing::debug!("RPC loop stopped");
    }

    fn register(&mut self, id: ConnectionId, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(connection = id, error = %e, "Failed to set TCP_NODELAY");
        }
        let connection = Connection::spawn(
            id,
            stream,
            peer,
            self.config.max_buffer_size,
            self.events_tx.clone(),
            self.shutdown.child_token(),
        );
        tracing::info!(connection = id, peer = %peer, "Connection established");
        for observer in self.observers.iter_mut() {
            observer.on_connect(&connection, &self.handle);
        }
        self.connections.insert(id, connection);
    }

    fn handle_command(&mut self, command: NetCommand) {
        match command {
            NetCommand::Call {
                connection,
                service,
                method,
                payload,
                on_response,
            } => {
                let Some(conn) = self.connections.get_mut(&connection) else {
                    tracing::debug!(connection, %service, %method, "Call on unknown connection dropped");
                    return;
                };
                match conn.send_request(&service, &method, payload, on_response) {
                    Ok(id) => tracing::trace!(connection, id, %service, %method, "Request sent"),
                    Err(e) => tracing::debug!(connection, error = %e, "Request dropped"),
                }
            }
            NetCommand::Respond {
                connection,
                id,
                service,
                method,
                payload,
            } => {
                let Some(conn) = self.connections.get_mut(&connection) else {
                    tracing::debug!(connection, id, "Response for closed connection dropped");
                    return;
                };
                if let Err(e) = conn.send_response(id, &service, &method, payload) {
                    tracing::debug!(connection, id, error = %e, "Response dropped");
                }
            }
            NetCommand::Close { connection } => {
                if let Some(conn) = self.connections.get_mut(&connection) {
                    conn.close();
                }
            }
            NetCommand::Connect { addr, done } => {
                if self.connections.contains_key(&CLIENT_CONNECTION_ID) {
                    let _ = done.send(Err(DistbuildError::AlreadyConnected(CLIENT_CONNECTION_ID)));
                    return;
                }
                let commands = self.handle.commands.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => {
                            let _ = commands.send(NetCommand::Connected {
                                stream,
                                peer: addr,
                                done,
                            });
                        }
                        Err(e) => {
                            tracing::warn!(addr = %addr, error = %e, "Connect failed");
                            let _ = done.send(Err(e.into()));
                        }
                    }
                });
            }
            NetCommand::Connected { stream, peer, done } => {
                if self.connections.contains_key(&CLIENT_CONNECTION_ID) {
                    let _ = done.send(Err(DistbuildError::AlreadyConnected(CLIENT_CONNECTION_ID)));
                    return;
                }
                self.register(CLIENT_CONNECTION_ID, stream, peer);
                let _ = done.send(Ok(CLIENT_CONNECTION_ID));
            }
        }
    }

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Frame {
                connection,
                envelope,
            } => self.handle_frame(connection, envelope),
            NetEvent::Closed { connection, reason } => {
                if self.connections.remove(&connection).is_none() {
                    return;
                }
                tracing::info!(connection, reason = %reason, "Connection closed");
                for observer in self.observers.iter_mut() {
                    observer.on_close(connection);
                }
            }
        }
    }

    fn handle_frame(&mut self, connection: ConnectionId, envelope: super::envelope::Envelope) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };

        if envelope.is_request() {
            let ctx = CallContext {
                connection,
                request_id: envelope.id,
                peer: conn.peer_addr(),
            };
            let service = envelope.service.clone();
            let method = envelope.method.clone();
            let payload = envelope.into_payload();
            if let Err(e) =
                self.registry
                    .dispatch(ctx, &service, &method, &payload, self.handle.clone())
            {
                tracing::error!(connection, %service, %method, error = %e, "Failed to handle request");
            }
        } else {
            let id = envelope.id;
            match conn.take_pending_call(id) {
                Some(on_response) => on_response(connection, envelope.into_payload()),
                None => tracing::warn!(connection, id, "Response for unknown request"),
            }
        }
    }
}

/// Delay before accepting again after `failures` consecutive errors:
/// doubles from [`ACCEPT_BACKOFF_MIN`] up to [`ACCEPT_BACKOFF_MAX`].
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
