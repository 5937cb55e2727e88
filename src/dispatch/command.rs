// src/dispatch/command.rs

//! Defines `Command` (one outstanding client request) and `ResponseSlot`
//! (its result object, completed exactly once by whichever task finishes it).

use crate::core::FabricError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Allocates transaction ids that are pairwise distinct among commands
/// simultaneously pending on one dispatcher's pool.
#[derive(Debug, Default)]
pub struct TidAllocator {
    next: AtomicU64,
}

impl TidAllocator {
    pub fn new() -> Self {
        // Start above zero; tid 0 is reserved for unsolicited notices.
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_tid(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// The terminal value held by a [`ResponseSlot`].
#[derive(Debug, Clone)]
enum SlotState {
    Pending,
    Done(Result<Bytes, FabricError>),
}

/// The result slot bound to a [`Command`].
///
/// Exactly one of success, error, or cancellation wins; later completions
/// are ignored. The slot is shared state rather than a oneshot channel
/// because failover requeues the same command, and the original waiter must
/// keep observing it across reassignment.
#[derive(Debug)]
pub struct ResponseSlot {
    state: Mutex<SlotState>,
    cancelled: AtomicBool,
    notify: Notify,
}

impl Default for ResponseSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Marks the response cancelled. The dispatcher drops cancelled commands
    /// before they reach a socket, and connections discard responses that
    /// would be delivered to a cancelled slot.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.complete(Err(FabricError::Cancelled));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Completes the slot. The first completion wins; subsequent calls are
    /// no-ops so a late response racing a timeout cannot clobber the result.
    pub fn complete(&self, result: Result<Bytes, FabricError>) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = SlotState::Done(result);
            drop(state);
            self.notify.notify_waiters();
        }
    }

    pub fn fail(&self, err: FabricError) {
        self.complete(Err(err));
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Done(_))
    }

    /// Returns the result if the slot is already complete.
    pub fn try_result(&self) -> Option<Result<Bytes, FabricError>> {
        match &*self.state.lock() {
            SlotState::Pending => None,
            SlotState::Done(r) => Some(r.clone()),
        }
    }

    /// Waits for completion. Safe against the notify/check race: the state
    /// is re-checked after registering for notification.
    pub async fn wait(&self) -> Result<Bytes, FabricError> {
        loop {
            let notified = self.notify.notified();
            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }
}

/// One outstanding client request, owned by the dispatcher until it is
/// matched to a response or cancelled/errored.
#[derive(Debug, Clone)]
pub struct Command {
    /// Unique among commands simultaneously pending on one pool.
    pub tid: u64,
    /// Attribute id stamped into the MAD header.
    pub attr: u16,
    /// Serialized request payload; opaque to the dispatcher.
    pub payload: Bytes,
    /// Commands not sent before this instant are expired, not written.
    pub expires_at: Instant,
    /// Set while the dispatcher is finding a connection for this command.
    connection_in_progress: Arc<AtomicBool>,
    pub response: Arc<ResponseSlot>,
}

impl Command {
    pub fn new(tid: u64, attr: u16, payload: Bytes, expires_at: Instant) -> Self {
        Self {
            tid,
            attr,
            payload,
            expires_at,
            connection_in_progress: Arc::new(AtomicBool::new(false)),
            response: Arc::new(ResponseSlot::new()),
        }
    }

    pub fn set_connection_in_progress(&self, value: bool) {
        self.connection_in_progress.store(value, Ordering::SeqCst);
    }

    pub fn is_connection_in_progress(&self) -> bool {
        self.connection_in_progress.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}
