// src/dispatch/handler.rs

//! The readiness-event vocabulary shared between connection tasks and the
//! dispatcher.
//!
//! Handlers are units of work bound to a readiness event. A connection task
//! classifies each wake into a [`Readiness`] variant and runs the matching
//! handler body; the outcome that matters to the owner is reported back to
//! the dispatcher task as a [`ConnEvent`], which reconciles it on its own
//! loop (pool membership, failover triggering, interest restoration).
//! Dispatch is a `match` over the variant, not a virtual override chain.

use super::command::Command;
use crate::core::FabricError;

/// A readiness event a connection handler is bound to. One variant per
/// event kind; the connection's dispatch function matches on the variant.
#[derive(Debug)]
pub enum Readiness {
    /// The non-blocking connect (and any TLS handshake) finished.
    ConnectFinished,
    /// A read completed: byte count, or the error that ended the channel.
    Readable(Result<usize, FabricError>),
    /// An assigned command is ready to be written.
    Writable(Command),
    /// The connect watchdog fired; treated exactly like a connection error.
    SimulatedTimeout,
}

/// A handler result reconciled on the dispatcher task.
#[derive(Debug)]
pub enum ConnEvent {
    /// The connection (including any TLS handshake) is usable.
    ConnectFinished { conn_id: u64 },

    /// The connect watchdog fired before the socket finished connecting.
    SimulatedTimeout { conn_id: u64 },

    /// The channel is unusable: peer closed, reset, connect refused, or a
    /// TLS fault. Pending commands stay in the connection's map so the
    /// dispatcher can requeue them after failover.
    ChannelError { conn_id: u64, cause: FabricError },

    /// A request-level fault that does not by itself condemn the channel
    /// (framing fault, decode fault). The dispatcher hands it to the
    /// failure policy, which decides whether to close the connection.
    HandlerError { conn_id: u64, cause: FabricError },

    /// The connection task exited after an orderly close.
    Closed { conn_id: u64 },
}

impl ConnEvent {
    pub fn conn_id(&self) -> u64 {
        match self {
            ConnEvent::ConnectFinished { conn_id }
            | ConnEvent::SimulatedTimeout { conn_id }
            | ConnEvent::ChannelError { conn_id, .. }
            | ConnEvent::HandlerError { conn_id, .. }
            | ConnEvent::Closed { conn_id } => *conn_id,
        }
    }
}

/// Verdict returned by a [`FailurePolicy`] for a request-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Close the connection and trigger failover.
    Fatal,
    /// Leave the connection alone.
    Ignore,
}

/// Pluggable failure evaluator for request-level errors. The decision
/// heuristics are deliberately opaque to the dispatcher; only the verdict
/// matters.
pub trait FailurePolicy: Send + Sync {
    fn classify(&self, error: &FabricError) -> Verdict;
}

/// Default policy: channel-shaped errors are fatal, everything else is
/// ignored (attached to the affected response only).
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFailurePolicy;

impl FailurePolicy for DefaultFailurePolicy {
    fn classify(&self, error: &FabricError) -> Verdict {
        if error.is_channel_error() {
            Verdict::Fatal
        } else {
            Verdict::Ignore
        }
    }
}
