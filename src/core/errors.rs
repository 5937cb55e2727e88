// src/core/errors.rs

//! Defines the primary error type for the dispatcher.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all failures the dispatcher can surface.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum FabricError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Connection timed out to {0}")]
    ConnectTimeout(String),

    #[error("Request expired before it could be sent")]
    RequestExpired,

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Management datagram status {code:#06x}: {reason}")]
    MadStatus { code: u16, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Credentials denied by user for host {0}")]
    CredentialsDenied(String),

    #[error("Failover failed: {0}")]
    FailoverFailed(String),

    #[error("Dispatcher is in a terminal connectivity-error state: {0}")]
    ConnectivityLost(String),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for FabricError {
    fn clone(&self) -> Self {
        match self {
            FabricError::Io(e) => FabricError::Io(Arc::clone(e)),
            FabricError::IncompleteData => FabricError::IncompleteData,
            FabricError::Framing(s) => FabricError::Framing(s.clone()),
            FabricError::ChannelClosed(s) => FabricError::ChannelClosed(s.clone()),
            FabricError::ConnectTimeout(s) => FabricError::ConnectTimeout(s.clone()),
            FabricError::RequestExpired => FabricError::RequestExpired,
            FabricError::Cancelled => FabricError::Cancelled,
            FabricError::MadStatus { code, reason } => FabricError::MadStatus {
                code: *code,
                reason: reason.clone(),
            },
            FabricError::Tls(s) => FabricError::Tls(s.clone()),
            FabricError::CredentialsDenied(s) => FabricError::CredentialsDenied(s.clone()),
            FabricError::FailoverFailed(s) => FabricError::FailoverFailed(s.clone()),
            FabricError::ConnectivityLost(s) => FabricError::ConnectivityLost(s.clone()),
            FabricError::ShuttingDown => FabricError::ShuttingDown,
            FabricError::InvalidConfig(s) => FabricError::InvalidConfig(s.clone()),
            FabricError::Internal(s) => FabricError::Internal(s.clone()),
        }
    }
}

impl PartialEq for FabricError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FabricError::Io(e1), FabricError::Io(e2)) => e1.to_string() == e2.to_string(),
            (FabricError::Framing(s1), FabricError::Framing(s2)) => s1 == s2,
            (FabricError::ChannelClosed(s1), FabricError::ChannelClosed(s2)) => s1 == s2,
            (FabricError::ConnectTimeout(s1), FabricError::ConnectTimeout(s2)) => s1 == s2,
            (
                FabricError::MadStatus {
                    code: c1,
                    reason: r1,
                },
                FabricError::MadStatus {
                    code: c2,
                    reason: r2,
                },
            ) => c1 == c2 && r1 == r2,
            (FabricError::Tls(s1), FabricError::Tls(s2)) => s1 == s2,
            (FabricError::CredentialsDenied(s1), FabricError::CredentialsDenied(s2)) => s1 == s2,
            (FabricError::FailoverFailed(s1), FabricError::FailoverFailed(s2)) => s1 == s2,
            (FabricError::ConnectivityLost(s1), FabricError::ConnectivityLost(s2)) => s1 == s2,
            (FabricError::InvalidConfig(s1), FabricError::InvalidConfig(s2)) => s1 == s2,
            (FabricError::Internal(s1), FabricError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl FabricError {
    /// Returns `true` when the error means the underlying channel is unusable
    /// and the owning connection must be torn down. These are the errors that
    /// trigger failover at the dispatcher level.
    pub fn is_channel_error(&self) -> bool {
        matches!(
            self,
            FabricError::Io(_)
                | FabricError::ChannelClosed(_)
                | FabricError::ConnectTimeout(_)
                | FabricError::Tls(_)
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for FabricError {
    fn from(e: std::io::Error) -> Self {
        FabricError::Io(Arc::new(e))
    }
}

impl From<rustls::Error> for FabricError {
    fn from(e: rustls::Error) -> Self {
        FabricError::Tls(e.to_string())
    }
}

impl From<String> for FabricError {
    fn from(s: String) -> Self {
        FabricError::Internal(s)
    }
}

/// Helper to check for non-critical disconnection errors that should be
/// logged at debug rather than warn.
pub fn is_normal_disconnect(e: &FabricError) -> bool {
    matches!(e, FabricError::Io(arc_err) if matches!(
        arc_err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionAborted
    ))
}
