// src/protocol/status.rs

//! Well-known management-datagram status codes and attribute identifiers.
//!
//! Payloads are opaque to the dispatcher; only the attribute id (for routing
//! notices) and the status code (for failure classification) are interpreted.

/// The request or response completed successfully.
pub const STATUS_OK: u16 = 0x0000;
/// Generic request failure reported by the FE.
pub const STATUS_FAILED: u16 = 0x0001;
/// The FE is up but the Subnet Manager behind it is unavailable.
pub const STATUS_SM_UNAVAILABLE: u16 = 0x0002;
/// The FE is up but the Performance Manager behind it is unavailable.
pub const STATUS_PM_UNAVAILABLE: u16 = 0x0003;
/// The FE is temporarily overloaded; the request may be retried.
pub const STATUS_BUSY: u16 = 0x0004;
/// The request referenced an attribute the FE does not implement.
pub const STATUS_UNSUPPORTED_ATTR: u16 = 0x0005;

/// Subnet Manager information (returns the list of SM identities).
pub const ATTR_SM_INFO: u16 = 0x0011;
/// Performance Manager liveness/configuration.
pub const ATTR_PM_INFO: u16 = 0x0012;
/// Asynchronous fabric notice; never correlated with a command.
pub const ATTR_NOTICE: u16 = 0x00F0;

/// Returns `true` for the status codes that mean the manager behind the FE is
/// gone. These are treated as connection-scoped failures: the command is
/// requeued and failover is triggered, because every other command on the
/// same host will fail the same way.
pub fn is_manager_unavailable(status: u16) -> bool {
    matches!(status, STATUS_SM_UNAVAILABLE | STATUS_PM_UNAVAILABLE)
}

/// Human-readable description for a status code, used in error messages.
pub fn status_reason(status: u16) -> &'static str {
    match status {
        STATUS_OK => "ok",
        STATUS_FAILED => "request failed",
        STATUS_SM_UNAVAILABLE => "subnet manager unavailable",
        STATUS_PM_UNAVAILABLE => "performance manager unavailable",
        STATUS_BUSY => "manager busy",
        STATUS_UNSUPPORTED_ATTR => "unsupported attribute",
        _ => "unknown status",
    }
}
