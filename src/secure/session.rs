// src/secure/session.rs

//! TLS channel built on the `rustls` record engine.
//!
//! The engine is driven by hand rather than through a wrapper stream:
//! ciphertext moves between the socket and the engine through two
//! [`StagingBuffer`]s whose fill/drain orientation is tracked explicitly,
//! and handshake progress follows the engine's `wants_read`/`wants_write`
//! signals. This keeps every byte's position auditable when a handshake
//! goes wrong in the field.

use super::buffers::StagingBuffer;
use crate::config::HostInfo;
use crate::core::FabricError;
use crate::dispatch::FabricStream;
use async_trait::async_trait;
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// How much ciphertext to request from the socket per read. One maximum
/// TLS record plus framing overhead.
const READ_CHUNK: usize = 16 * 1024 + 512;

/// Initial staging buffer capacity; grows on demand up to [`STAGING_LIMIT`].
const INITIAL_STAGING: usize = 4 * 1024;

/// Hard cap on each staging buffer. Four maximum records of headroom.
const STAGING_LIMIT: usize = 4 * (16 * 1024 + 512);

/// An established TLS session over TCP, exposing the same byte-stream
/// contract as a plaintext connection.
#[derive(Debug)]
pub struct SecureStream {
    tcp: TcpStream,
    engine: ClientConnection,
    /// Ciphertext from the peer, on its way into the engine.
    recv: StagingBuffer,
    /// Ciphertext from the engine, on its way to the peer.
    send: StagingBuffer,
    scratch: Box<[u8]>,
    /// Peer sent close_notify; no more application data will arrive.
    peer_closed: bool,
    /// Socket hit EOF.
    tcp_eof: bool,
}

impl SecureStream {
    /// Connects the TLS layer over an already-established TCP stream and
    /// runs the handshake to completion.
    pub async fn connect(
        tcp: TcpStream,
        config: Arc<ClientConfig>,
        host: &HostInfo,
    ) -> Result<Self, FabricError> {
        let server_name = ServerName::try_from(host.host.clone())
            .map_err(|e| FabricError::Tls(format!("invalid server name {:?}: {e}", host.host)))?;
        let engine = ClientConnection::new(config, server_name)
            .map_err(|e| FabricError::Tls(e.to_string()))?;

        let mut stream = Self {
            tcp,
            engine,
            recv: StagingBuffer::with_capacity(INITIAL_STAGING, STAGING_LIMIT),
            send: StagingBuffer::with_capacity(INITIAL_STAGING, STAGING_LIMIT),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            peer_closed: false,
            tcp_eof: false,
        };
        stream.handshake(host).await?;
        Ok(stream)
    }

    /// Drives the handshake: write flights out when the engine has them,
    /// otherwise feed it more ciphertext from the peer.
    async fn handshake(&mut self, host: &HostInfo) -> Result<(), FabricError> {
        while self.engine.is_handshaking() {
            if self.engine.wants_write() {
                self.pump_writes().await?;
                continue;
            }
            if self.engine.wants_read() {
                let n = self.fill_ciphertext().await?;
                if n == 0 {
                    return Err(FabricError::Tls(format!(
                        "{} closed the channel during the handshake",
                        host.endpoint()
                    )));
                }
                self.process_records()?;
                continue;
            }
            return Err(FabricError::Tls("handshake made no progress".into()));
        }
        // Flush the final flight before reporting the channel usable.
        self.pump_writes().await?;

        debug!(
            "TLS session to {} established ({:?})",
            host.endpoint(),
            self.engine.negotiated_cipher_suite().map(|s| s.suite())
        );
        Ok(())
    }

    /// Reads one chunk of ciphertext from the socket into the receive
    /// staging buffer. Returns the byte count; zero means socket EOF.
    ///
    /// Cancel-safe: bytes are only staged after the socket read completes,
    /// and a cancelled read transfers nothing.
    async fn fill_ciphertext(&mut self) -> Result<usize, FabricError> {
        self.recv.ready_to_fill();
        if self.recv.spare() == 0 {
            self.recv.ensure_spare(READ_CHUNK)?;
        }
        let want = self.recv.spare().min(self.scratch.len());
        let n = self.tcp.read(&mut self.scratch[..want]).await?;
        if n == 0 {
            self.tcp_eof = true;
            return Ok(0);
        }
        trace!("TLS: staged {n} ciphertext bytes from peer");
        let accepted = self.recv.fill_slice(&self.scratch[..n])?;
        debug_assert_eq!(accepted, n);
        Ok(n)
    }

    /// Feeds staged ciphertext to the engine and processes the resulting
    /// records. Plaintext becomes available through the engine's reader.
    fn process_records(&mut self) -> Result<(), FabricError> {
        self.recv.ready_to_drain();
        while !self.recv.is_empty() {
            let before = self.recv.len();
            {
                let mut rd = self.recv.engine_reader()?;
                self.engine
                    .read_tls(&mut rd)
                    .map_err(FabricError::from)?;
            }
            let state = self
                .engine
                .process_new_packets()
                .map_err(|e| FabricError::Tls(e.to_string()))?;
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
            if self.recv.len() == before {
                // Engine's internal buffer is full; drain plaintext first.
                break;
            }
        }
        self.recv.ready_to_fill();
        Ok(())
    }

    /// Drains all engine-produced ciphertext to the socket.
    async fn pump_writes(&mut self) -> Result<(), FabricError> {
        while self.engine.wants_write() {
            self.send.ready_to_fill();
            {
                let mut wr = self.send.engine_writer()?;
                self.engine.write_tls(&mut wr).map_err(FabricError::from)?;
            }
            self.flush_send().await?;
        }
        Ok(())
    }

    async fn flush_send(&mut self) -> Result<(), FabricError> {
        self.send.ready_to_drain();
        while !self.send.is_empty() {
            let n = self.tcp.write(self.send.chunk()).await?;
            self.send.consume(n)?;
        }
        self.tcp.flush().await?;
        self.send.ready_to_fill();
        Ok(())
    }
}

#[async_trait]
impl FabricStream for SecureStream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, FabricError> {
        loop {
            // Hand out whatever plaintext the engine already decoded.
            match self.engine.reader().read(&mut self.scratch[..]) {
                Ok(0) => return Ok(0), // clean close_notify
                Ok(n) => {
                    buf.extend_from_slice(&self.scratch[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            if self.peer_closed || self.tcp_eof {
                return Ok(0);
            }
            if self.fill_ciphertext().await? > 0 {
                self.process_records()?;
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), FabricError> {
        let mut offset = 0;
        while offset < data.len() {
            let n = self
                .engine
                .writer()
                .write(&data[offset..])
                .map_err(FabricError::from)?;
            if n == 0 {
                return Err(FabricError::Tls("engine accepted no plaintext".into()));
            }
            offset += n;
            self.pump_writes().await?;
        }
        self.pump_writes().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), FabricError> {
        self.engine.send_close_notify();
        self.pump_writes().await?;
        self.tcp.shutdown().await?;
        Ok(())
    }
}
