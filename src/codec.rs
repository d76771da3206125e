// Length-prefixed JSON framing used for every TCP control/data request in the
// system (see SPEC_FULL.md §6, §9). The reference implementation this system
// is modeled on reads a single fixed 1024-byte buffer per request, which
// silently truncates anything larger; this codec resolves that open question
// with an explicit 4-byte big-endian length prefix and a configurable frame
// size ceiling so oversized messages fail loudly (ProtocolError) instead of
// corrupting the payload.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChunkServerError;

/// Default ceiling on a single frame's JSON payload, in bytes. Generous
/// relative to `chunk_size` defaults so a WRITE carrying a full chunk's
/// content (base64-free, raw UTF-8) still fits comfortably.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("connection closed")]
    Closed,
    #[error("frame of {0} bytes exceeds the {1} byte ceiling")]
    TooLarge(u32, u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CodecError> for ChunkServerError {
    fn from(e: CodecError) -> Self {
        ChunkServerError::Protocol(e.to_string())
    }
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value)?;
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON frame and decodes it as `T`. Returns
/// `CodecError::Closed` if the peer closed the connection before sending a
/// length prefix (the normal end-of-connection case for this protocol, since
/// every connection carries exactly one request/response pair).
pub async fn read_frame<R, T>(reader: &mut R, max_bytes: u32) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(CodecError::Closed),
        Err(e) => return Err(CodecError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > max_bytes {
        return Err(CodecError::TooLarge(len, max_bytes));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let value = serde_json::from_slice(&buf)?;
    Ok(value)
}
