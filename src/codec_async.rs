//! Async length-prefixed JSON framing.
//!
//! This module provides async versions of the codec functions for use with tokio.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{LENGTH_PREFIX_SIZE, encode, parse_body, payload_length};
use crate::error::{BridgeError, Result};

/// Read one frame from an async stream.
pub async fn read_frame_async<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut prefix).await.map_err(eof_as_lost)?;

    let len = payload_length(prefix)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(eof_as_lost)?;

    parse_body(&body)
}

/// Write one frame to an async stream, returning the number of bytes written.
pub async fn write_frame_async<W, T>(writer: &mut W, payload: &T) -> Result<usize>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let frame = encode(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}

fn eof_as_lost(err: std::io::Error) -> BridgeError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => BridgeError::ConnectionLost(err.to_string()),
        _ => BridgeError::Io(err),
    }
}
