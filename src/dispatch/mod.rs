// src/dispatch/mod.rs

//! Command dispatch: commands and their response slots, per-socket
//! connection state machines, the connection pool, and the per-subnet
//! dispatcher that ties them together.

mod command;
mod connection;
mod dispatcher;
mod handler;
mod pool;
mod stream;

pub use command::{Command, ResponseSlot, TidAllocator};
pub use connection::{ConnState, Connection, ConnectionHandle};
pub use dispatcher::SubnetDispatcher;
pub use handler::{ConnEvent, DefaultFailurePolicy, FailurePolicy, Readiness, Verdict};
pub use pool::{ConnectionPool, DefaultPoolingPolicy, NoPoolingPolicy, PoolingPolicy};
pub use stream::{FabricStream, PlainStream};
