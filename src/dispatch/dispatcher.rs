// src/dispatch/dispatcher.rs

//! The per-subnet request dispatcher: a dedicated task that owns the
//! connection pool, the pending-command queue, and failover triggering.
//!
//! All pool membership and assignment state is mutated only on the
//! dispatcher task (single-writer discipline); callers interact through the
//! cloneable [`SubnetDispatcher`] facade, whose channels are safe from any
//! thread.

use super::command::{Command, TidAllocator};
use super::connection::{Connection, ConnectionHandle};
use super::handler::{ConnEvent, DefaultFailurePolicy, FailurePolicy, Verdict};
use super::pool::{ConnectionPool, DefaultPoolingPolicy, PoolingPolicy};
use crate::config::{DispatcherConfig, SubnetConfig};
use crate::core::FabricError;
use crate::core::events::EventBus;
use crate::failover::{FailoverManager, FailoverOutcome, Prober};
use crate::secure::TlsProvisioner;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

/// Control messages for the dispatcher task.
enum Control {
    SessionAdded,
    SessionRemoved,
    FailoverDone(Result<FailoverOutcome, FabricError>),
    RetryFailover,
    Shutdown,
}

/// State shared between the facade and the dispatcher task.
struct Shared {
    subnet_name: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    ctrl_tx: mpsc::UnboundedSender<Control>,
    tids: TidAllocator,
    events: Arc<EventBus>,
    sessions: AtomicUsize,
    active_host: AtomicUsize,
    /// Set when failover has exhausted every candidate host; cleared only by
    /// a successful retry.
    terminal: parking_lot::Mutex<Option<FabricError>>,
}

/// The public handle to one subnet's dispatcher.
#[derive(Clone)]
pub struct SubnetDispatcher {
    shared: Arc<Shared>,
    config: DispatcherConfig,
}

impl SubnetDispatcher {
    /// Spawns the dispatcher task for `subnet` and returns the facade.
    pub fn spawn(
        subnet: SubnetConfig,
        config: DispatcherConfig,
        events: Arc<EventBus>,
        provisioner: Option<Arc<dyn TlsProvisioner>>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self::spawn_with_policies(
            subnet,
            config,
            events,
            provisioner,
            prober,
            Arc::new(DefaultFailurePolicy),
            None,
        )
    }

    /// As [`Self::spawn`], with injected failure/pooling policies.
    pub fn spawn_with_policies(
        subnet: SubnetConfig,
        config: DispatcherConfig,
        events: Arc<EventBus>,
        provisioner: Option<Arc<dyn TlsProvisioner>>,
        prober: Arc<dyn Prober>,
        failure_policy: Arc<dyn FailurePolicy>,
        pooling_policy: Option<Arc<dyn PoolingPolicy>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            subnet_name: subnet.name.clone(),
            cmd_tx,
            ctrl_tx,
            tids: TidAllocator::new(),
            events: events.clone(),
            sessions: AtomicUsize::new(0),
            active_host: AtomicUsize::new(subnet.active_host),
            terminal: parking_lot::Mutex::new(None),
        });

        let pooling_policy = pooling_policy.unwrap_or_else(|| {
            Arc::new(DefaultPoolingPolicy {
                min: config.pool_min,
                max: config.pool_max,
                conns_per_session: config.conns_per_session,
            })
        });

        let reactor = Reactor {
            // The reactor must not keep the facade state alive: when the
            // last facade drops, the command and control channels close and
            // the reactor tears itself down.
            shared: Arc::downgrade(&shared),
            events,
            config: config.clone(),
            subnet,
            pool: ConnectionPool::new(),
            initializing: HashMap::new(),
            waiting: VecDeque::new(),
            pooling_policy,
            failure_policy,
            provisioner,
            prober,
            workers: Arc::new(Semaphore::new(config.worker_limit)),
            cmd_rx,
            ctrl_rx,
            result_rx,
            result_tx,
            next_conn_id: 1,
            sessions_dirty: true,
            failing_over: false,
            shutting_down: false,
            known_sms: Vec::new(),
        };
        tokio::spawn(reactor.run());

        Self { shared, config }
    }

    /// Creates a command with a fresh transaction id and the configured
    /// default expiry, and queues it. The returned command's response can be
    /// awaited by the caller.
    pub fn submit(&self, attr: u16, payload: Bytes) -> Command {
        let cmd = Command::new(
            self.shared.tids.next_tid(),
            attr,
            payload,
            tokio::time::Instant::now() + self.config.command_timeout,
        );
        self.queue_cmd(cmd.clone());
        cmd
    }

    /// Fire-and-forget enqueue, safe from any thread. Completion or error
    /// is delivered through the command's response object. In a terminal
    /// connectivity-error state the response fails immediately.
    pub fn queue_cmd(&self, cmd: Command) {
        if let Some(err) = self.shared.terminal.lock().clone() {
            cmd.response.fail(err);
            return;
        }
        cmd.set_connection_in_progress(true);
        if self.shared.cmd_tx.send(cmd).is_err() {
            debug!(
                "Dispatcher for subnet '{}' is gone; command dropped",
                self.shared.subnet_name
            );
        }
    }

    /// Registers a new active session; the pool grows on the next pass.
    pub fn add_session(&self) {
        self.shared.sessions.fetch_add(1, Ordering::SeqCst);
        let _ = self.shared.ctrl_tx.send(Control::SessionAdded);
    }

    /// Removes an active session; the pool shrinks on the next pass.
    pub fn remove_session(&self) {
        let _ = self
            .shared
            .sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        let _ = self.shared.ctrl_tx.send(Control::SessionRemoved);
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    /// Index of the host currently considered active (updated by failover).
    pub fn active_host(&self) -> usize {
        self.shared.active_host.load(Ordering::SeqCst)
    }

    /// Returns the terminal connectivity error, if failover has given up.
    pub fn connectivity_error(&self) -> Option<FabricError> {
        self.shared.terminal.lock().clone()
    }

    /// Clears a terminal connectivity-error state and starts a fresh
    /// failover attempt.
    pub fn retry_connectivity(&self) {
        *self.shared.terminal.lock() = None;
        let _ = self.shared.ctrl_tx.send(Control::RetryFailover);
    }

    /// Stops accepting new work and closes every connection.
    pub fn shutdown(&self) {
        *self.shared.terminal.lock() = Some(FabricError::ShuttingDown);
        let _ = self.shared.ctrl_tx.send(Control::Shutdown);
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.shared.events
    }

    /// Allocates a transaction id from this dispatcher's pool-unique space.
    pub fn next_tid(&self) -> u64 {
        self.shared.tids.next_tid()
    }
}

/// The dispatcher task state. Everything here is owned by one task.
struct Reactor {
    /// Weak so the reactor never outlives its facades: the facade-owned
    /// channel senders are the only thing keeping the loop alive.
    shared: Weak<Shared>,
    events: Arc<EventBus>,
    config: DispatcherConfig,
    subnet: SubnetConfig,
    pool: ConnectionPool,
    /// Connections whose non-blocking connect is still in flight.
    initializing: HashMap<u64, ConnectionHandle>,
    /// Commands queued but not yet assigned to a connection.
    waiting: VecDeque<Command>,
    pooling_policy: Arc<dyn PoolingPolicy>,
    failure_policy: Arc<dyn FailurePolicy>,
    provisioner: Option<Arc<dyn TlsProvisioner>>,
    prober: Arc<dyn Prober>,
    workers: Arc<Semaphore>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    ctrl_rx: mpsc::UnboundedReceiver<Control>,
    result_rx: mpsc::UnboundedReceiver<ConnEvent>,
    result_tx: mpsc::UnboundedSender<ConnEvent>,
    next_conn_id: u64,
    sessions_dirty: bool,
    failing_over: bool,
    shutting_down: bool,
    /// SM identities observed on the last healthy host; the failover
    /// manager uses them for the correct-subnet check.
    known_sms: Vec<u64>,
}

impl Reactor {
    async fn run(mut self) {
        info!(
            "Dispatcher for subnet '{}' started with {} candidate host(s)",
            self.subnet.name,
            self.subnet.hosts.len()
        );

        loop {
            // Pool maintenance runs before blocking: session-count changes
            // and failover completions both mark the pool dirty.
            if self.sessions_dirty && !self.failing_over && !self.shutting_down {
                self.sessions_dirty = false;
                self.maintain_pool();
            }
            self.assign_waiting();

            tokio::select! {
                biased;
                ctrl = self.ctrl_rx.recv() => match ctrl {
                    Some(ctrl) => {
                        if self.handle_control(ctrl) {
                            break;
                        }
                    }
                    // Every facade is gone; nothing can reach this subnet
                    // again, so close the pool instead of leaking it.
                    None => {
                        self.teardown();
                        break;
                    }
                },
                Some(event) = self.result_rx.recv() => self.reconcile(event),
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.enqueue(cmd),
                    None => {
                        self.teardown();
                        break;
                    }
                },
            }
        }

        info!("Dispatcher for subnet '{}' stopped", self.subnet.name);
    }

    /// Returns `true` when the loop should exit.
    fn handle_control(&mut self, ctrl: Control) -> bool {
        match ctrl {
            Control::SessionAdded | Control::SessionRemoved => {
                self.sessions_dirty = true;
            }
            Control::FailoverDone(result) => self.finish_failover(result),
            Control::RetryFailover => {
                if !self.failing_over && !self.shutting_down {
                    self.trigger_failover(FabricError::ChannelClosed(
                        "manual connectivity retry".into(),
                    ));
                }
            }
            Control::Shutdown => {
                self.teardown();
                return true;
            }
        }
        false
    }

    /// Fails everything queued or in flight and drops every connection
    /// handle, which asks each connection task to close its socket.
    fn teardown(&mut self) {
        self.shutting_down = true;
        for cmd in self.waiting.drain(..) {
            cmd.response.fail(FabricError::ShuttingDown);
        }
        for handle in self.pool.drain_all() {
            handle.fail_pending(&FabricError::ShuttingDown);
        }
        self.initializing.clear();
    }

    /// Recomputes pool growth from the pooling policy and issues connects
    /// for the difference.
    fn maintain_pool(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let sessions = shared.sessions.load(Ordering::SeqCst);
        let current = self.pool.len() + self.initializing.len();
        let growth = self.pooling_policy.desired_growth(current, sessions);

        if growth > 0 {
            debug!(
                "Subnet '{}': growing pool by {} (sessions={}, current={})",
                self.subnet.name, growth, sessions, current
            );
            for _ in 0..growth {
                self.spawn_connection();
            }
        } else if growth < 0 {
            for _ in 0..(-growth) {
                // Shrink from the pool only; connects in flight will join
                // and be trimmed on a later pass if still excessive.
                let Some(victim_id) = self.pool.iter().map(|c| c.id()).next() else {
                    break;
                };
                if let Some(handle) = self.pool.remove(victim_id) {
                    self.requeue_pending(&handle);
                }
            }
        }
    }

    fn spawn_connection(&mut self) {
        let host_index = self.subnet.active_host;
        let Some(host) = self.subnet.hosts.get(host_index).cloned() else {
            warn!(
                "Subnet '{}': active host index {} out of range",
                self.subnet.name, host_index
            );
            return;
        };

        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let handle = Connection::spawn(
            id,
            host,
            false,
            self.config.connect_timeout,
            self.result_tx.clone(),
            self.events.clone(),
            self.workers.clone(),
            self.provisioner.clone(),
        );
        self.initializing.insert(id, handle);
    }

    /// Reconciles one completed handler result on the dispatcher task.
    fn reconcile(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::ConnectFinished { conn_id } => {
                if let Some(handle) = self.initializing.remove(&conn_id) {
                    debug!(
                        "Subnet '{}': connection {} joined the pool",
                        self.subnet.name, conn_id
                    );
                    self.pool.add(handle);
                }
            }
            ConnEvent::SimulatedTimeout { conn_id } => {
                let cause = FabricError::ConnectTimeout(format!(
                    "connection {conn_id} watchdog expired"
                ));
                self.handle_connection_failure(conn_id, cause);
            }
            ConnEvent::ChannelError { conn_id, cause } => {
                self.handle_connection_failure(conn_id, cause);
            }
            ConnEvent::HandlerError { conn_id, cause } => {
                match self.failure_policy.classify(&cause) {
                    Verdict::Fatal => self.handle_connection_failure(conn_id, cause),
                    Verdict::Ignore => debug!(
                        "Subnet '{}': ignoring request-level error on connection {}: {}",
                        self.subnet.name, conn_id, cause
                    ),
                }
            }
            ConnEvent::Closed { conn_id } => {
                // Orderly close we requested; nothing left to reconcile.
                self.pool.remove(conn_id);
                self.initializing.remove(&conn_id);
            }
        }
    }

    /// Removes a failed connection, requeues its in-flight commands, and
    /// triggers failover.
    fn handle_connection_failure(&mut self, conn_id: u64, cause: FabricError) {
        let handle = self
            .pool
            .remove(conn_id)
            .or_else(|| self.initializing.remove(&conn_id));

        let Some(handle) = handle else {
            // Stragglers from a pool already torn down for failover.
            debug!(
                "Subnet '{}': late failure from connection {}: {}",
                self.subnet.name, conn_id, cause
            );
            return;
        };

        self.requeue_pending(&handle);
        drop(handle);

        if self.shutting_down {
            return;
        }
        if self.failing_over {
            debug!(
                "Subnet '{}': connection {} failed during failover: {}",
                self.subnet.name, conn_id, cause
            );
            return;
        }
        self.trigger_failover(cause);
    }

    /// Puts a dead connection's in-flight commands back on the waiting
    /// queue so they are retried once service is re-established.
    fn requeue_pending(&mut self, handle: &ConnectionHandle) {
        for cmd in handle.drain_pending() {
            if cmd.response.is_cancelled() || cmd.response.is_done() {
                continue;
            }
            cmd.set_connection_in_progress(true);
            self.waiting.push_back(cmd);
        }
    }

    /// Tears the pool down and starts the failover manager.
    fn trigger_failover(&mut self, cause: FabricError) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        warn!(
            "Subnet '{}': active host unusable ({}); starting failover",
            self.subnet.name, cause
        );
        self.failing_over = true;

        for handle in self.pool.drain_all() {
            self.requeue_pending(&handle);
        }
        self.initializing.clear();

        let manager = FailoverManager::new(
            self.config.failover.clone(),
            self.prober.clone(),
            self.events.clone(),
            self.known_sms.clone(),
        );
        let candidates = self.failover_candidates();
        let ctrl_tx = shared.ctrl_tx.clone();
        tokio::spawn(async move {
            let result = manager.run(candidates).await;
            let _ = ctrl_tx.send(Control::FailoverDone(result));
        });
    }

    /// Candidate hosts in subnet-configured order, starting after the
    /// failed active host and wrapping around to include it last.
    fn failover_candidates(&self) -> Vec<(usize, crate::config::HostInfo)> {
        let n = self.subnet.hosts.len();
        let active = self.subnet.active_host;
        (1..=n)
            .map(|offset| {
                let idx = (active + offset) % n;
                (idx, self.subnet.hosts[idx].clone())
            })
            .collect()
    }

    fn finish_failover(&mut self, result: Result<FailoverOutcome, FabricError>) {
        self.failing_over = false;
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match result {
            Ok(outcome) => {
                info!(
                    "Subnet '{}': failover succeeded; new active host index {}",
                    self.subnet.name, outcome.host_index
                );
                shared
                    .active_host
                    .store(outcome.host_index, Ordering::SeqCst);
                self.subnet.active_host = outcome.host_index;
                self.known_sms = outcome.sm_identities;
                // Rebuild the pool against the new host; waiting commands
                // are assigned as connections come up.
                self.sessions_dirty = true;
            }
            Err(e) => {
                warn!(
                    "Subnet '{}': failover failed: {}; entering terminal connectivity-error state",
                    self.subnet.name, e
                );
                let terminal = FabricError::ConnectivityLost(e.to_string());
                *shared.terminal.lock() = Some(terminal.clone());
                for cmd in self.waiting.drain(..) {
                    cmd.response.fail(terminal.clone());
                }
            }
        }
    }

    fn enqueue(&mut self, cmd: Command) {
        if self.shutting_down {
            cmd.response.fail(FabricError::ShuttingDown);
            return;
        }
        let terminal = self
            .shared
            .upgrade()
            .and_then(|shared| shared.terminal.lock().clone());
        if let Some(err) = terminal {
            cmd.response.fail(err);
            return;
        }
        if cmd.response.is_cancelled() {
            // Cancelled before assignment: never touches a connection.
            debug!(
                "Subnet '{}': dropping cancelled command tid={}",
                self.subnet.name, cmd.tid
            );
            return;
        }
        self.waiting.push_back(cmd);
    }

    /// Drains the pending-command queue onto pooled connections, round
    /// robin, discarding cancelled commands.
    fn assign_waiting(&mut self) {
        while let Some(cmd) = self.waiting.pop_front() {
            if cmd.response.is_cancelled() {
                continue;
            }
            if cmd.is_expired(tokio::time::Instant::now()) {
                cmd.response.fail(FabricError::RequestExpired);
                continue;
            }
            let Some(conn) = self.pool.next_connection() else {
                self.waiting.push_front(cmd);
                return;
            };
            let tracker = cmd.clone();
            match conn.assign(cmd) {
                Ok(()) => tracker.set_connection_in_progress(false),
                Err(cmd) => {
                    // The task died between pool insertion and now; its
                    // channel-error event will reconcile the membership.
                    self.waiting.push_front(cmd);
                    return;
                }
            }
        }
    }
}
