// src/failover/probe.rs

//! Probing candidate hosts during failover.
//!
//! The manager drives probes through the [`Prober`] seam so tests can
//! script host behavior. [`FeProber`] is the real implementation: it opens
//! throwaway temporary connections and issues SM/PM queries over them.

use crate::config::HostInfo;
use crate::core::FabricError;
use crate::core::events::EventBus;
use crate::dispatch::{Command, ConnEvent, Connection, TidAllocator};
use crate::protocol::status;
use crate::secure::TlsProvisioner;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::debug;

/// An open probe session against one candidate host.
#[async_trait]
pub trait ProbeSession: Send {
    /// Queries the host for the subnet-manager identities it knows.
    async fn sm_identities(&mut self) -> Result<Vec<u64>, FabricError>;

    /// Verifies the performance manager is reachable through this host.
    async fn check_pm(&mut self) -> Result<(), FabricError>;
}

/// Opens probe sessions and runs auxiliary verifications for failover.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn open(&self, host: &HostInfo) -> Result<Box<dyn ProbeSession>, FabricError>;

    /// Verifies the host sustains `count` simultaneous connections.
    async fn verify_capacity(&self, host: &HostInfo, count: usize) -> Result<(), FabricError>;
}

/// Handler concurrency for probe connections. Probes are low-volume.
const PROBE_WORKERS: usize = 4;

/// The real prober: temporary connections speaking the management-datagram
/// protocol. Probe connections never join any pool; a failure on one fails
/// only its own result instead of triggering another failover.
pub struct FeProber {
    connect_timeout: Duration,
    probe_timeout: Duration,
    events: Arc<EventBus>,
    provisioner: Option<Arc<dyn TlsProvisioner>>,
    workers: Arc<Semaphore>,
    tids: Arc<TidAllocator>,
    next_conn_id: AtomicU64,
}

impl FeProber {
    pub fn new(
        connect_timeout: Duration,
        probe_timeout: Duration,
        events: Arc<EventBus>,
        provisioner: Option<Arc<dyn TlsProvisioner>>,
    ) -> Self {
        Self {
            connect_timeout,
            probe_timeout,
            events,
            provisioner,
            workers: Arc::new(Semaphore::new(PROBE_WORKERS)),
            tids: Arc::new(TidAllocator::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    fn spawn_probe_connection(
        &self,
        host: &HostInfo,
    ) -> (
        crate::dispatch::ConnectionHandle,
        mpsc::UnboundedReceiver<ConnEvent>,
    ) {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let handle = Connection::spawn(
            id,
            host.clone(),
            true,
            self.connect_timeout,
            result_tx,
            self.events.clone(),
            self.workers.clone(),
            self.provisioner.clone(),
        );
        (handle, result_rx)
    }

    /// Waits for the connect outcome of one probe connection.
    async fn await_connect(
        host: &HostInfo,
        result_rx: &mut mpsc::UnboundedReceiver<ConnEvent>,
    ) -> Result<(), FabricError> {
        loop {
            match result_rx.recv().await {
                Some(ConnEvent::ConnectFinished { .. }) => return Ok(()),
                Some(ConnEvent::SimulatedTimeout { .. }) => {
                    return Err(FabricError::ConnectTimeout(host.endpoint()));
                }
                Some(ConnEvent::ChannelError { cause, .. }) => return Err(cause),
                Some(ConnEvent::HandlerError { cause, .. }) => return Err(cause),
                Some(ConnEvent::Closed { .. }) | None => {
                    return Err(FabricError::ChannelClosed(format!(
                        "probe connection to {} closed before connecting",
                        host.endpoint()
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl Prober for FeProber {
    async fn open(&self, host: &HostInfo) -> Result<Box<dyn ProbeSession>, FabricError> {
        debug!("Failover: opening probe session to {}", host.endpoint());
        let (handle, mut result_rx) = self.spawn_probe_connection(host);
        Self::await_connect(host, &mut result_rx).await?;
        Ok(Box::new(FeProbeSession {
            handle,
            result_rx,
            tids: self.tids.clone(),
            probe_timeout: self.probe_timeout,
        }))
    }

    async fn verify_capacity(&self, host: &HostInfo, count: usize) -> Result<(), FabricError> {
        debug!(
            "Failover: verifying {} can sustain {} simultaneous connections",
            host.endpoint(),
            count
        );
        let mut opened = Vec::with_capacity(count);
        for _ in 0..count {
            opened.push(self.spawn_probe_connection(host));
        }
        // All connects race in parallel; every one of them must succeed.
        let results = futures::future::join_all(
            opened
                .iter_mut()
                .map(|(_, result_rx)| Self::await_connect(host, result_rx)),
        )
        .await;
        for result in results {
            result?;
        }
        // Dropping the handles closes the verification connections.
        Ok(())
    }
}

/// A probe session backed by one temporary connection.
struct FeProbeSession {
    handle: crate::dispatch::ConnectionHandle,
    result_rx: mpsc::UnboundedReceiver<ConnEvent>,
    tids: Arc<TidAllocator>,
    probe_timeout: Duration,
}

impl FeProbeSession {
    async fn query(&mut self, attr: u16) -> Result<Bytes, FabricError> {
        let cmd = Command::new(
            self.tids.next_tid(),
            attr,
            Bytes::new(),
            tokio::time::Instant::now() + self.probe_timeout,
        );
        self.handle
            .assign(cmd.clone())
            .map_err(|_| FabricError::ChannelClosed("probe connection is gone".into()))?;

        let deadline = tokio::time::sleep(self.probe_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                result = cmd.response.wait() => return result,
                Some(event) = self.result_rx.recv() => {
                    if let ConnEvent::ChannelError { cause, .. } = event {
                        return Err(cause);
                    }
                }
                _ = &mut deadline => return Err(FabricError::RequestExpired),
            }
        }
    }
}

#[async_trait]
impl ProbeSession for FeProbeSession {
    async fn sm_identities(&mut self) -> Result<Vec<u64>, FabricError> {
        let payload = self.query(status::ATTR_SM_INFO).await?;
        if payload.len() % 8 != 0 {
            return Err(FabricError::Framing(format!(
                "SM info payload length {} is not a multiple of 8",
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                u64::from_be_bytes(raw)
            })
            .collect())
    }

    async fn check_pm(&mut self) -> Result<(), FabricError> {
        self.query(status::ATTR_PM_INFO).await.map(|_| ())
    }
}
