// src/dispatch/pool.rs

//! The connection pool and its sizing/selection policies.
//!
//! The pool is owned exclusively by the dispatcher task; nothing here is
//! shared across threads. Sizing is recomputed whenever the active-session
//! count changes, and the whole pool is torn down and rebuilt against the
//! new host after a failover.

use super::connection::ConnectionHandle;

/// Decides how many connections a subnet should gain or lose given the
/// current pool size and active-session count.
pub trait PoolingPolicy: Send + Sync {
    /// Positive to grow, negative to shrink, zero to leave alone.
    fn desired_growth(&self, current_connections: usize, current_sessions: usize) -> i64;
}

/// Default policy: target `clamp(conns_per_session * sessions, min, max)`.
#[derive(Debug, Clone)]
pub struct DefaultPoolingPolicy {
    pub min: usize,
    pub max: usize,
    pub conns_per_session: usize,
}

impl Default for DefaultPoolingPolicy {
    fn default() -> Self {
        Self {
            min: 3,
            max: 10,
            conns_per_session: 3,
        }
    }
}

impl PoolingPolicy for DefaultPoolingPolicy {
    fn desired_growth(&self, current_connections: usize, current_sessions: usize) -> i64 {
        let target = (self.conns_per_session * current_sessions).clamp(self.min, self.max);
        target as i64 - current_connections as i64
    }
}

/// Policy for ad-hoc probe connections during failover: the pool never
/// grows or shrinks on its own and callers manage members directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPoolingPolicy;

impl PoolingPolicy for NoPoolingPolicy {
    fn desired_growth(&self, _current_connections: usize, _current_sessions: usize) -> i64 {
        0
    }
}

/// The live set of connections for one subnet, selected round robin.
#[derive(Default)]
pub struct ConnectionPool {
    members: Vec<ConnectionHandle>,
    next: usize,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn add(&mut self, conn: ConnectionHandle) {
        self.members.push(conn);
    }

    /// Removes a member by id, returning it so the caller can drain its
    /// pending commands.
    pub fn remove(&mut self, conn_id: u64) -> Option<ConnectionHandle> {
        let pos = self.members.iter().position(|c| c.id() == conn_id)?;
        let conn = self.members.remove(pos);
        if self.next > pos {
            self.next -= 1;
        }
        Some(conn)
    }

    pub fn get(&self, conn_id: u64) -> Option<&ConnectionHandle> {
        self.members.iter().find(|c| c.id() == conn_id)
    }

    /// Strict round robin over the live pool, wrapping on overflow.
    pub fn next_connection(&mut self) -> Option<&ConnectionHandle> {
        if self.members.is_empty() {
            return None;
        }
        let idx = self.next % self.members.len();
        self.next = (idx + 1) % self.members.len();
        Some(&self.members[idx])
    }

    /// Tears the whole pool down, returning the members for cleanup.
    pub fn drain_all(&mut self) -> Vec<ConnectionHandle> {
        self.next = 0;
        std::mem::take(&mut self.members)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.members.iter()
    }
}
