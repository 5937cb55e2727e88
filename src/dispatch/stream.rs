// src/dispatch/stream.rs

//! The byte-stream contract a connection drives, and its plain-TCP
//! implementation. The TLS implementation lives in [`crate::secure`] and
//! keeps this exact contract while swapping the buffer management
//! underneath.

use crate::core::FabricError;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The application-level read/write contract used by [`super::Connection`].
///
/// `read_buf` must be cancel-safe: a caller may drop the future between
/// polls (the connection loop selects over it) without losing bytes.
#[async_trait]
pub trait FabricStream: Send {
    /// Reads at least one byte into `buf`, returning the count. A return of
    /// zero means the peer closed the channel.
    async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, FabricError>;

    /// Writes the entire slice.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), FabricError>;

    /// Drives an orderly close of the channel.
    async fn shutdown(&mut self) -> Result<(), FabricError>;
}

/// A stream whose channel is already gone. Used to service events that
/// arrive for a connection with no live socket, e.g. the connect watchdog.
pub struct ClosedStream;

#[async_trait]
impl FabricStream for ClosedStream {
    async fn read_buf(&mut self, _buf: &mut BytesMut) -> Result<usize, FabricError> {
        Err(FabricError::ChannelClosed("stream already closed".into()))
    }

    async fn write_all(&mut self, _data: &[u8]) -> Result<(), FabricError> {
        Err(FabricError::ChannelClosed("stream already closed".into()))
    }

    async fn shutdown(&mut self) -> Result<(), FabricError> {
        Ok(())
    }
}

/// A plaintext TCP stream.
pub struct PlainStream {
    tcp: TcpStream,
}

impl PlainStream {
    pub fn new(tcp: TcpStream) -> Self {
        Self { tcp }
    }
}

#[async_trait]
impl FabricStream for PlainStream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, FabricError> {
        Ok(self.tcp.read_buf(buf).await?)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), FabricError> {
        self.tcp.write_all(data).await?;
        self.tcp.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), FabricError> {
        self.tcp.shutdown().await?;
        Ok(())
    }
}
