// src/failover/mod.rs

//! Failover: when the active host becomes unusable, probe the remaining
//! candidates in order and promote the first one that verifies fully
//! (connect, correct subnet, performance manager, connection capacity).

mod manager;
mod probe;
mod state;

pub use manager::{FailoverManager, FailoverOutcome};
pub use probe::{FeProber, ProbeSession, Prober};
pub use state::{HostStatus, ProgressTracker, VerificationState};
