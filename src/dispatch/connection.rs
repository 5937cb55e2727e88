// src/dispatch/connection.rs

//! The per-socket connection state machine.
//!
//! Each connection is driven by exactly one task, which serializes its read
//! and write cycles (no handler for the same connection can run twice
//! concurrently). Exclusion holds by construction: the task awaits each
//! cycle to completion before selecting the next readiness event, so a
//! command assigned mid-write waits in the channel until the write is done.
//! The dispatcher owns a [`ConnectionHandle`]; dropping the handle is the
//! close request. Handler execution across all connections is bounded by
//! the dispatcher's worker semaphore.

use super::command::Command;
use super::handler::{ConnEvent, Readiness};
use super::stream::{FabricStream, PlainStream};
use crate::config::HostInfo;
use crate::core::events::{ConnectionEvent, EventBus, Notice};
use crate::core::{FabricError, errors::is_normal_disconnect};
use crate::protocol::{MadCodec, MadFrame, status};
use crate::secure::{SecureStream, TlsProvisioner};
use bytes::BytesMut;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::codec::Decoder;
use tracing::{debug, error, warn};

/// Initial capacity of the adaptive input buffer; the codec reserves more
/// once a frame header declares a larger message.
const INITIAL_READ_BUF: usize = 8 * 1024;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnState {
    Connecting,
    Handshaking,
    Connected,
    Closing,
    Closed,
}

/// What the connection task should do after handling one readiness event.
enum Flow {
    Continue,
    Exit,
}

/// Outcome of connection establishment.
enum Established {
    Stream(Box<dyn FabricStream>),
    /// Watchdog fired; reported via `Readiness::SimulatedTimeout`.
    TimedOut,
    /// Connect or handshake failed; already reported to the owner.
    Failed,
}

/// The dispatcher-side handle to a live connection.
///
/// Owns the assignment channel; dropping the handle asks the task to close.
/// The pending-command map is shared so the dispatcher can requeue in-flight
/// commands when the connection dies.
pub struct ConnectionHandle {
    id: u64,
    host: HostInfo,
    temporary: bool,
    cmd_tx: mpsc::UnboundedSender<Command>,
    pending: Arc<DashMap<u64, Command>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Assigns a command to this connection (requests write interest).
    /// Returns the command back if the task has already exited.
    pub fn assign(&self, cmd: Command) -> Result<(), Command> {
        self.cmd_tx.send(cmd).map_err(|e| e.0)
    }

    /// Number of commands currently awaiting a response on this connection.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Drains every in-flight command, e.g. for requeueing after failover.
    pub fn drain_pending(&self) -> Vec<Command> {
        let tids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        tids.into_iter()
            .filter_map(|tid| self.pending.remove(&tid).map(|(_, cmd)| cmd))
            .collect()
    }

    /// Fails every in-flight command with the given error.
    pub fn fail_pending(&self, cause: &FabricError) {
        for cmd in self.drain_pending() {
            cmd.response.fail(cause.clone());
        }
    }
}

/// Everything a connection task needs to run.
pub struct Connection {
    id: u64,
    host: HostInfo,
    temporary: bool,
    connect_timeout: Duration,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    result_tx: mpsc::UnboundedSender<ConnEvent>,
    pending: Arc<DashMap<u64, Command>>,
    events: Arc<EventBus>,
    workers: Arc<Semaphore>,
    provisioner: Option<Arc<dyn TlsProvisioner>>,
    state: ConnState,
    peer: SocketAddr,
    codec: MadCodec,
}

impl Connection {
    /// Spawns the driving task for a new connection and returns its handle.
    /// The connection is not usable until the dispatcher sees
    /// [`ConnEvent::ConnectFinished`] for it.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: u64,
        host: HostInfo,
        temporary: bool,
        connect_timeout: Duration,
        result_tx: mpsc::UnboundedSender<ConnEvent>,
        events: Arc<EventBus>,
        workers: Arc<Semaphore>,
        provisioner: Option<Arc<dyn TlsProvisioner>>,
    ) -> ConnectionHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let pending: Arc<DashMap<u64, Command>> = Arc::new(DashMap::new());

        let conn = Connection {
            id,
            host: host.clone(),
            temporary,
            connect_timeout,
            cmd_rx,
            result_tx,
            pending: pending.clone(),
            events,
            workers,
            provisioner,
            state: ConnState::Connecting,
            peer: SocketAddr::from(([0, 0, 0, 0], 0)),
            codec: MadCodec,
        };
        tokio::spawn(conn.run());

        ConnectionHandle {
            id,
            host,
            temporary,
            cmd_tx,
            pending,
        }
    }

    async fn run(mut self) {
        let mut read_buf = BytesMut::with_capacity(INITIAL_READ_BUF);
        let mut stream = match self.establish().await {
            Established::Stream(stream) => stream,
            Established::TimedOut => {
                // There is no stream to service; report the watchdog firing
                // through the same dispatch path as every other event.
                let mut gone: Box<dyn FabricStream> = Box::new(super::stream::ClosedStream);
                self.handle_readiness(Readiness::SimulatedTimeout, &mut gone, &mut read_buf)
                    .await;
                return;
            }
            Established::Failed => return,
        };

        if let Flow::Exit = self
            .handle_readiness(Readiness::ConnectFinished, &mut stream, &mut read_buf)
            .await
        {
            return;
        }

        loop {
            let readiness = tokio::select! {
                biased;
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => Readiness::Writable(cmd),
                    None => {
                        // Owner dropped the handle: orderly close.
                        self.close(&mut stream).await;
                        return;
                    }
                },
                result = stream.read_buf(&mut read_buf) => Readiness::Readable(result),
            };

            if let Flow::Exit = self
                .handle_readiness(readiness, &mut stream, &mut read_buf)
                .await
            {
                return;
            }
        }
    }

    /// The handler dispatch function: one readiness event in, one handler
    /// body out, bounded by the shared worker pool.
    async fn handle_readiness(
        &mut self,
        event: Readiness,
        stream: &mut Box<dyn FabricStream>,
        read_buf: &mut BytesMut,
    ) -> Flow {
        let workers = Arc::clone(&self.workers);
        let _permit = workers.acquire().await.ok();
        match event {
            Readiness::ConnectFinished => {
                self.state = ConnState::Connected;
                self.handle_connect_finished();
                Flow::Continue
            }
            Readiness::Writable(cmd) => self.handle_writable(stream, cmd).await,
            Readiness::Readable(result) => self.handle_readable(read_buf, result).await,
            Readiness::SimulatedTimeout => {
                self.state = ConnState::Closed;
                self.send_event(ConnEvent::SimulatedTimeout { conn_id: self.id });
                Flow::Exit
            }
        }
    }

    /// Connect (with watchdog) and, for secure hosts, run the TLS handshake.
    async fn establish(&mut self) -> Established {
        let endpoint = self.host.endpoint();
        debug!("Connection {} connecting to {}", self.id, endpoint);

        let tcp = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&endpoint))
            .await
        {
            Err(_) => {
                // Watchdog fired: delivered as a simulated timeout event,
                // which the dispatcher treats like any connection error.
                warn!(
                    "Connection {} to {} timed out after {:?}",
                    self.id, endpoint, self.connect_timeout
                );
                return Established::TimedOut;
            }
            Ok(Err(e)) => {
                self.fail_channel(FabricError::from(e));
                return Established::Failed;
            }
            Ok(Ok(tcp)) => tcp,
        };

        if let Ok(peer) = tcp.peer_addr() {
            self.peer = peer;
        }

        if !self.host.secure {
            return Established::Stream(Box::new(PlainStream::new(tcp)));
        }

        self.state = ConnState::Handshaking;
        let Some(provisioner) = self.provisioner.clone() else {
            self.fail_channel(FabricError::Tls(format!(
                "host {endpoint} requires TLS but no provisioner is configured"
            )));
            return Established::Failed;
        };

        // A user-denied-credentials condition aborts setup rather than
        // retrying; it still surfaces as a channel error to the owner.
        let config = match provisioner.client_config(&self.host).await {
            Ok(config) => config,
            Err(e) => {
                self.fail_channel(e);
                return Established::Failed;
            }
        };

        match SecureStream::connect(tcp, config, &self.host).await {
            Ok(secure) => Established::Stream(Box::new(secure)),
            Err(e) => {
                self.fail_channel(e);
                Established::Failed
            }
        }
    }

    fn handle_connect_finished(&self) {
        debug!("Connection {} to {} established", self.id, self.peer);
        self.send_event(ConnEvent::ConnectFinished { conn_id: self.id });
        self.events
            .publish_connection_event(ConnectionEvent::Established {
                conn_id: self.id,
                peer: self.peer,
            });
    }

    /// Write cycle: encode and send one assigned command, skipping anything
    /// cancelled or expired so it never reaches the socket.
    async fn handle_writable(&mut self, stream: &mut Box<dyn FabricStream>, cmd: Command) -> Flow {
        if cmd.response.is_cancelled() {
            debug!(
                "Connection {}: discarding cancelled command tid={}",
                self.id, cmd.tid
            );
            return Flow::Continue;
        }
        if cmd.is_expired(tokio::time::Instant::now()) {
            cmd.response.fail(FabricError::RequestExpired);
            return Flow::Continue;
        }

        let frame = MadFrame::request(cmd.tid, cmd.attr, cmd.payload.clone());
        let mut out = BytesMut::with_capacity(frame.encoded_len());
        if let Err(e) = tokio_util::codec::Encoder::encode(&mut self.codec, frame, &mut out) {
            cmd.response.fail(e.clone());
            self.send_event(ConnEvent::HandlerError {
                conn_id: self.id,
                cause: e,
            });
            return Flow::Continue;
        }

        // The command must be findable by tid before its response can race in.
        self.pending.insert(cmd.tid, cmd);

        if let Err(e) = stream.write_all(&out).await {
            return self.exit_with_channel_error(e);
        }
        Flow::Continue
    }

    /// Read cycle: decode as many complete frames as are already buffered
    /// and dispatch each one.
    async fn handle_readable(
        &mut self,
        read_buf: &mut BytesMut,
        result: Result<usize, FabricError>,
    ) -> Flow {
        match result {
            Ok(0) => {
                return self.exit_with_channel_error(FabricError::ChannelClosed(format!(
                    "connection to {} closed by peer",
                    self.peer
                )));
            }
            Err(e) => return self.exit_with_channel_error(e),
            Ok(_) => {}
        }

        loop {
            match self.codec.decode(read_buf) {
                Ok(Some(frame)) => {
                    if let Flow::Exit = self.dispatch_frame(frame) {
                        return Flow::Exit;
                    }
                }
                Ok(None) => return Flow::Continue,
                Err(e) => {
                    // A failed validity check poisons every response still
                    // outstanding on this channel, not just the current
                    // read. Closing is the failure policy's call.
                    error!("Connection {}: framing error: {}", self.id, e);
                    self.fail_all_pending(&e);
                    read_buf.clear();
                    self.send_event(ConnEvent::HandlerError {
                        conn_id: self.id,
                        cause: e,
                    });
                    return Flow::Continue;
                }
            }
        }
    }

    /// Routes one decoded frame: notices fan out to listeners, everything
    /// else is matched to a pending command by transaction id.
    fn dispatch_frame(&mut self, frame: MadFrame) -> Flow {
        if frame.attr == status::ATTR_NOTICE {
            self.events.publish_notice(Notice {
                attr: frame.attr,
                payload: frame.payload,
                source: self.peer,
            });
            return Flow::Continue;
        }

        let Some((_, cmd)) = self.pending.remove(&frame.tid) else {
            // Response for an already-cancelled or timed-out command.
            debug!(
                "Connection {}: dropping response for unknown tid {}",
                self.id, frame.tid
            );
            return Flow::Continue;
        };

        if status::is_manager_unavailable(frame.status) {
            let cause = FabricError::ChannelClosed(format!(
                "{} reported by {}",
                status::status_reason(frame.status),
                self.peer
            ));
            if self.temporary {
                // Throwaway probe connection: the command owns the failure.
                cmd.response.fail(cause.clone());
            } else {
                // Put the command back; it is retried after failover.
                self.pending.insert(cmd.tid, cmd);
            }
            return self.exit_with_channel_error(cause);
        }

        if frame.status != status::STATUS_OK {
            cmd.response.fail(FabricError::MadStatus {
                code: frame.status,
                reason: status::status_reason(frame.status).to_string(),
            });
            return Flow::Continue;
        }

        if cmd.response.is_cancelled() {
            warn!(
                "Connection {}: response for tid {} arrived after cancellation",
                self.id, cmd.tid
            );
            return Flow::Continue;
        }
        cmd.response.complete(Ok(frame.payload));
        Flow::Continue
    }

    fn fail_all_pending(&self, cause: &FabricError) {
        let tids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for tid in tids {
            if let Some((_, cmd)) = self.pending.remove(&tid) {
                cmd.response.fail(cause.clone());
            }
        }
    }

    /// Reports a fatal channel error and exits the task. Pending commands
    /// stay in the map for the dispatcher to requeue.
    fn exit_with_channel_error(&mut self, cause: FabricError) -> Flow {
        if is_normal_disconnect(&cause) {
            debug!("Connection {} lost: {}", self.id, cause);
        } else {
            warn!("Connection {} lost: {}", self.id, cause);
        }
        self.state = ConnState::Closed;
        self.fail_channel(cause);
        Flow::Exit
    }

    fn fail_channel(&mut self, cause: FabricError) {
        self.state = ConnState::Closed;
        self.events.publish_connection_event(ConnectionEvent::Lost {
            conn_id: self.id,
            peer: self.peer,
            cause: cause.clone(),
        });
        self.send_event(ConnEvent::ChannelError {
            conn_id: self.id,
            cause,
        });
    }

    async fn close(&mut self, stream: &mut Box<dyn FabricStream>) {
        debug!(
            "Connection {} closing (was {})",
            self.id, self.state
        );
        self.state = ConnState::Closing;
        if let Err(e) = stream.shutdown().await {
            debug!("Connection {}: error during close: {}", self.id, e);
        }
        self.state = ConnState::Closed;
        self.send_event(ConnEvent::Closed { conn_id: self.id });
    }

    fn send_event(&self, event: ConnEvent) {
        // The dispatcher may already be gone during shutdown.
        let _ = self.result_tx.send(event);
    }
}
