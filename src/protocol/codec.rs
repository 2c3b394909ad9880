//! Frame codec for the control channel
//!
//! One frame is a 4-byte big-endian payload length followed by that many
//! bytes of UTF-8 encoded JSON. Reads retry until the exact byte count is
//! collected; a peer closing mid-frame is a connection fault, not a short
//! frame.

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame header size: 4-byte big-endian payload length.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame payload size (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("socket connection broken")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("malformed frame payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        // tokio's exact-length reads surface a mid-frame close as EOF.
        if err.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::ConnectionClosed
        } else {
            CodecError::Io(err)
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Encode one message and write it as a single frame.
pub async fn write_frame<W>(writer: &mut W, message: &Value) -> CodecResult<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(payload.len(), MAX_FRAME_SIZE));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame and decode its payload.
pub async fn read_frame<R>(reader: &mut R) -> CodecResult<Value>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await?;
    let length = u32::from_be_bytes(prefix) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(length, MAX_FRAME_SIZE));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(serde_json::from_slice(&payload)?)
}
