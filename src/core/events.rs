// src/core/events.rs

//! Defines the event buses through which the dispatcher reports connection
//! lifecycle changes, asynchronous fabric notices, and failover progress to
//! orchestration, persistence, and GUI layers.
//!
//! All buses are `tokio::sync::broadcast` channels: publishing never blocks
//! the dispatcher, and a lagging subscriber drops events instead of applying
//! backpressure to socket handling.

use crate::core::FabricError;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the connection/notice buses. Large enough to absorb bursts
/// from a full pool reconnecting at once.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Capacity of the failover progress bus. Progress is low-rate.
const PROGRESS_BUS_CAPACITY: usize = 64;

/// A connection lifecycle event, delivered to orchestration layers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection finished its (optionally TLS) setup and is usable.
    Established { conn_id: u64, peer: SocketAddr },
    /// The connection failed or was closed; `cause` explains why.
    Lost {
        conn_id: u64,
        peer: SocketAddr,
        cause: FabricError,
    },
}

/// A decoded asynchronous fabric notice. The payload stays opaque here;
/// attribute semantics belong to the consumer.
#[derive(Debug, Clone)]
pub struct Notice {
    pub attr: u16,
    pub payload: Bytes,
    pub source: SocketAddr,
}

/// An incremental failover progress report for GUI layers.
#[derive(Debug, Clone)]
pub struct FailoverProgress {
    /// Non-decreasing percentage in `0..=100`.
    pub percent: u8,
    /// Human-readable status line ("probing host b...", etc.).
    pub message: String,
}

/// The central distribution hub for everything the dispatcher publishes.
#[derive(Debug)]
pub struct EventBus {
    connection_sender: broadcast::Sender<ConnectionEvent>,
    notice_sender: broadcast::Sender<Notice>,
    progress_sender: broadcast::Sender<FailoverProgress>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (connection_sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (notice_sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (progress_sender, _) = broadcast::channel(PROGRESS_BUS_CAPACITY);
        Self {
            connection_sender,
            notice_sender,
            progress_sender,
        }
    }

    /// Publishes a connection lifecycle event. It's okay if nobody listens.
    pub fn publish_connection_event(&self, event: ConnectionEvent) {
        if self.connection_sender.send(event).is_err() {
            debug!("Published a connection event with no active subscribers.");
        }
    }

    /// Fans an asynchronous notice out to all registered notice listeners.
    pub fn publish_notice(&self, notice: Notice) {
        if self.notice_sender.send(notice).is_err() {
            debug!("Published a notice with no active subscribers.");
        }
    }

    /// Publishes a failover progress report.
    pub fn publish_progress(&self, progress: FailoverProgress) {
        debug!(
            "Failover progress {}%: {}",
            progress.percent, progress.message
        );
        if self.progress_sender.send(progress).is_err() {
            debug!("Published failover progress with no active subscribers.");
        }
    }

    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_sender.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notice_sender.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<FailoverProgress> {
        self.progress_sender.subscribe()
    }
}
