// src/secure/mod.rs

//! Secure channels: oriented staging buffers, the hand-driven TLS record
//! session, and credential provisioning.

mod buffers;
mod provision;
mod session;

pub use buffers::{Orientation, StagingBuffer};
pub use provision::{CredentialAssistant, Credentials, DefaultTlsProvisioner, TlsProvisioner};
pub use session::SecureStream;
