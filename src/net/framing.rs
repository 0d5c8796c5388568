//! Length-delimited envelope framing
//!
//! Frame layout:
//!
//! ```text
//! | MAGIC (4) | LEN u32 LE (4) | CHECKSUM (4) | postcard(WireEnvelope) (LEN) |
//! ```
//!
//! The checksum is the first four bytes of SHA3-256 over the payload. The
//! reader rejects oversized frames before allocating and drains their payload
//! so the stream stays aligned on frame boundaries.

use super::message::{NetworkEnvelope, WireEnvelope};
use super::serde_safe::{from_bytes, to_bytes};
use super::types::{FRAME_HEADER_SIZE, PROTOCOL_MAGIC};
use crate::crypto::checksum;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("invalid checksum")]
    InvalidChecksum,
    #[error("message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),
    #[error("decode error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("encode error: {0}")]
    Encode(postcard::Error),
}

/// Payload decode failure, split by cause so the session can classify it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Envelope tag this build does not know
    #[error("unknown envelope class {tag} (message version {message_version})")]
    UnknownClass { message_version: u32, tag: u32 },
    /// Known tag, malformed body
    #[error("invalid envelope data: {reason}")]
    InvalidData {
        message_version: Option<u32>,
        reason: String,
    },
}

impl ResolveError {
    /// Message version declared by the frame, if it could be read
    pub fn message_version(&self) -> Option<u32> {
        match self {
            ResolveError::UnknownClass { message_version, .. } => Some(*message_version),
            ResolveError::InvalidData { message_version, .. } => *message_version,
        }
    }
}

/// Turns a raw frame payload into an envelope
pub trait EnvelopeResolver: Send + Sync {
    fn decode(&self, frame: &[u8]) -> Result<WireEnvelope, ResolveError>;
}

/// Number of `NetworkEnvelope` variants; tags at or above are unknown classes
pub const ENVELOPE_VARIANT_COUNT: u32 = 10;

/// Default resolver for postcard-encoded `WireEnvelope`s
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardResolver;

impl EnvelopeResolver for PostcardResolver {
    fn decode(&self, frame: &[u8]) -> Result<WireEnvelope, ResolveError> {
        let (message_version, rest) =
            postcard::take_from_bytes::<u32>(frame).map_err(|e| ResolveError::InvalidData {
                message_version: None,
                reason: e.to_string(),
            })?;

        let (tag, _) =
            postcard::take_from_bytes::<u32>(rest).map_err(|e| ResolveError::InvalidData {
                message_version: Some(message_version),
                reason: e.to_string(),
            })?;
        if tag >= ENVELOPE_VARIANT_COUNT {
            return Err(ResolveError::UnknownClass { message_version, tag });
        }

        from_bytes(frame).map_err(|e| ResolveError::InvalidData {
            message_version: Some(message_version),
            reason: e.to_string(),
        })
    }
}

/// Decoded frame together with its payload size on the wire
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub wire: WireEnvelope,
    pub size: usize,
}

/// Reading half of a session
pub struct EnvelopeReader<R> {
    reader: R,
    max_frame_size: usize,
    resolver: Arc<dyn EnvelopeResolver>,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(reader: R, max_frame_size: usize, resolver: Arc<dyn EnvelopeResolver>) -> Self {
        Self {
            reader,
            max_frame_size,
            resolver,
        }
    }

    /// Read one frame. `Ok(None)` is a clean end of stream between frames.
    pub async fn read_envelope(&mut self) -> Result<Option<ReceivedFrame>, FrameError> {
        let mut magic = [0u8; 4];
        let n = self.reader.read(&mut magic).await?;
        if n == 0 {
            return Ok(None);
        }
        self.reader.read_exact(&mut magic[n..]).await?;
        if magic != PROTOCOL_MAGIC {
            return Err(FrameError::InvalidMagic);
        }

        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut expected = [0u8; 4];
        self.reader.read_exact(&mut expected).await?;

        // Early size check prevents memory exhaustion
        if len > self.max_frame_size {
            self.discard(len).await?;
            return Err(FrameError::MessageTooLarge(len, self.max_frame_size));
        }

        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data).await?;

        if checksum(&data) != expected {
            return Err(FrameError::InvalidChecksum);
        }

        let wire = self.resolver.decode(&data)?;
        Ok(Some(ReceivedFrame { wire, size: len }))
    }

    async fn discard(&mut self, len: usize) -> Result<(), FrameError> {
        let mut limited = (&mut self.reader).take(len as u64);
        let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if copied < len as u64 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    message_version: u32,
    envelope: &'a NetworkEnvelope,
}

/// Writing half of a session. Not reentrant; the session serializes callers.
pub struct EnvelopeWriter<W> {
    writer: W,
    message_version: u32,
}

impl<W: AsyncWrite + Unpin> EnvelopeWriter<W> {
    pub fn new(writer: W, message_version: u32) -> Self {
        Self {
            writer,
            message_version,
        }
    }

    /// Frame and write one envelope, returning the payload size
    pub async fn write_envelope(
        &mut self,
        envelope: &NetworkEnvelope,
        max_size: usize,
    ) -> Result<usize, FrameError> {
        let data = to_bytes(&WireEnvelopeRef {
            message_version: self.message_version,
            envelope,
        })
        .map_err(FrameError::Encode)?;

        if data.len() > max_size {
            return Err(FrameError::MessageTooLarge(data.len(), max_size));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
        frame.extend_from_slice(&PROTOCOL_MAGIC);
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(&data));
        frame.extend_from_slice(&data);

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;

        Ok(data.len())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Raw frame with an arbitrary payload, for peers that misbehave on purpose
pub fn encode_raw_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&PROTOCOL_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(payload));
    frame.extend_from_slice(payload);
    frame
}
