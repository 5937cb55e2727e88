// src/lib.rs

pub mod config;
pub mod core;
pub mod dispatch;
pub mod failover;
pub mod protocol;
pub mod secure;

// Re-export
pub use crate::core::FabricError;
pub use crate::dispatch::SubnetDispatcher;
