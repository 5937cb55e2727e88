// src/secure/buffers.rs

//! Staging buffers for the TLS record layer.
//!
//! Each buffer is either being filled (bytes appended at the back) or being
//! drained (bytes consumed from the front). The orientation is tracked
//! explicitly and every accessor checks it, so a "ready to read" buffer can
//! never be confused with a "ready to append" one between calls. Mixing the
//! two up is the classic failure mode of this layer.

use crate::core::FabricError;
use bytes::BytesMut;
use std::io;

/// Which way a staging buffer is currently oriented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Bytes may be appended; reading is an error.
    Filling,
    /// Bytes may be consumed from the front; appending is an error.
    Draining,
}

/// A growable byte buffer with an explicit fill/drain orientation and a
/// hard capacity limit.
#[derive(Debug)]
pub struct StagingBuffer {
    data: BytesMut,
    orientation: Orientation,
    limit: usize,
}

impl StagingBuffer {
    /// Creates a buffer in the `Filling` orientation.
    pub fn with_capacity(initial: usize, limit: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(initial.min(limit)),
            orientation: Orientation::Filling,
            limit,
        }
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Spare capacity available for filling without growing.
    pub fn spare(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Flips to the `Draining` orientation. Idempotent.
    pub fn ready_to_drain(&mut self) {
        self.orientation = Orientation::Draining;
    }

    /// Flips to the `Filling` orientation. Idempotent. Any unconsumed bytes
    /// are kept; new bytes append after them.
    pub fn ready_to_fill(&mut self) {
        self.orientation = Orientation::Filling;
    }

    fn check(&self, wanted: Orientation, op: &str) -> Result<(), FabricError> {
        if self.orientation != wanted {
            return Err(FabricError::Internal(format!(
                "staging buffer {op} while oriented {:?}",
                self.orientation
            )));
        }
        Ok(())
    }

    /// Ensures at least `min_spare` bytes can be appended, growing up to
    /// the limit. Fails when the limit cannot accommodate the request;
    /// the caller surfaces that as an oversized-record error.
    pub fn ensure_spare(&mut self, min_spare: usize) -> Result<(), FabricError> {
        self.check(Orientation::Filling, "grow")?;
        if self.spare() >= min_spare {
            return Ok(());
        }
        let wanted = self.data.len() + min_spare;
        if wanted > self.limit {
            return Err(FabricError::Framing(format!(
                "staging buffer would exceed its {} byte limit (wanted {})",
                self.limit, wanted
            )));
        }
        self.data.reserve(min_spare);
        Ok(())
    }

    /// Appends as many bytes from `src` as the limit allows, returning the
    /// count accepted.
    pub fn fill_slice(&mut self, src: &[u8]) -> Result<usize, FabricError> {
        self.check(Orientation::Filling, "fill")?;
        let room = self.limit.saturating_sub(self.data.len());
        let take = src.len().min(room);
        self.data.extend_from_slice(&src[..take]);
        Ok(take)
    }

    /// The readable front of the buffer.
    pub fn chunk(&self) -> &[u8] {
        &self.data
    }

    /// Consumes `n` bytes from the front.
    pub fn consume(&mut self, n: usize) -> Result<(), FabricError> {
        self.check(Orientation::Draining, "consume")?;
        if n > self.data.len() {
            return Err(FabricError::Internal(format!(
                "staging buffer over-consumed: {n} of {}",
                self.data.len()
            )));
        }
        bytes::Buf::advance(&mut self.data, n);
        Ok(())
    }

    /// An `io::Read` view for handing the drained bytes to the TLS engine.
    pub fn engine_reader(&mut self) -> Result<EngineReader<'_>, FabricError> {
        self.check(Orientation::Draining, "read")?;
        Ok(EngineReader { inner: self })
    }

    /// An `io::Write` view for collecting ciphertext from the TLS engine.
    pub fn engine_writer(&mut self) -> Result<EngineWriter<'_>, FabricError> {
        self.check(Orientation::Filling, "write")?;
        Ok(EngineWriter { inner: self })
    }
}

/// Drains a `StagingBuffer` through `io::Read`.
pub struct EngineReader<'a> {
    inner: &'a mut StagingBuffer,
}

impl io::Read for EngineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.chunk().len().min(buf.len());
        buf[..n].copy_from_slice(&self.inner.chunk()[..n]);
        self.inner
            .consume(n)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(n)
    }
}

/// Fills a `StagingBuffer` through `io::Write`.
pub struct EngineWriter<'a> {
    inner: &'a mut StagingBuffer,
}

impl io::Write for EngineWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let accepted = self
            .inner
            .fill_slice(buf)
            .map_err(|e| io::Error::other(e.to_string()))?;
        if accepted == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "staging buffer at capacity limit",
            ));
        }
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
