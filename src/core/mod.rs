// src/core/mod.rs

//! The central module containing shared error and event types.

pub mod errors;
pub mod events;

pub use errors::FabricError;
