//! Length-prefixed JSON framing.
//!
//! Every message, in either direction, is a 4-byte big-endian length
//! followed by that many bytes of UTF-8 JSON:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |         Length (u32, BE)          |  (4 bytes)
//! +--------+--------+--------+--------+
//! |       JSON payload ...            |  (Length bytes)
//! +--------+--------+--------+--------+
//! ```

use std::io::{self, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum accepted payload length (100 MiB).
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Encode a payload into a complete frame.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes> {
    let body = serde_json::to_vec(payload).map_err(BridgeError::Encode)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(BridgeError::PayloadTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decode one complete frame.
///
/// The declared length is validated before anything else is looked at, so
/// a corrupt prefix never turns into a large allocation.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < LENGTH_PREFIX_SIZE {
        return Err(BridgeError::malformed(format!(
            "frame too short: expected at least {LENGTH_PREFIX_SIZE} bytes, got {}",
            frame.len()
        )));
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&frame[..LENGTH_PREFIX_SIZE]);
    let len = payload_length(prefix)?;

    let body = &frame[LENGTH_PREFIX_SIZE..];
    if body.len() != len {
        return Err(BridgeError::malformed(format!(
            "length mismatch: prefix says {len} bytes, got {}",
            body.len()
        )));
    }

    parse_body(body)
}

/// Validate a length prefix and return the payload length it declares.
pub fn payload_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(BridgeError::malformed("empty frame"));
    }
    if len > MAX_FRAME_SIZE {
        return Err(BridgeError::PayloadTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| BridgeError::malformed(format!("invalid JSON: {e}")))
}

/// Read one frame from a stream.
///
/// Reads exactly the declared number of bytes. A clean timeout (nothing of
/// the frame consumed yet) is reported as [`BridgeError::Timeout`]; a timeout
/// after part of the frame arrived leaves the stream unusable and is
/// reported as [`BridgeError::Desynchronized`].
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    read_frame_sized(reader).map(|(payload, _)| payload)
}

/// Like [`read_frame`], also returning the frame's size on the wire.
pub fn read_frame_sized<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<(T, usize)> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    read_full(reader, &mut prefix, 0)?;

    let len = payload_length(prefix)?;

    let mut body = vec![0u8; len];
    read_full(reader, &mut body, LENGTH_PREFIX_SIZE)?;

    Ok((parse_body(&body)?, LENGTH_PREFIX_SIZE + len))
}

/// Write one frame to a stream, returning the number of bytes written.
pub fn write_frame<W: Write, T: Serialize + ?Sized>(writer: &mut W, payload: &T) -> Result<usize> {
    let frame = encode(payload)?;
    write_encoded(writer, &frame)?;
    Ok(frame.len())
}

/// Write a frame previously produced by [`encode`].
pub fn write_encoded<W: Write>(writer: &mut W, frame: &[u8]) -> Result<()> {
    write_full(writer, frame)?;
    writer.flush().map_err(|e| write_error(e, frame.len()))
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], already: usize) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(BridgeError::connection_lost("peer closed the connection")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e, already + filled)),
        }
    }
    Ok(())
}

fn write_full<W: Write>(writer: &mut W, buf: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(BridgeError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole frame",
                )));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(write_error(e, written)),
        }
    }
    Ok(())
}

fn read_error(err: io::Error, transferred: usize) -> BridgeError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock if transferred == 0 => {
            BridgeError::Timeout
        }
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            BridgeError::Desynchronized { transferred }
        }
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => BridgeError::ConnectionLost(err.to_string()),
        _ => BridgeError::Io(err),
    }
}

fn write_error(err: io::Error, transferred: usize) -> BridgeError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock if transferred == 0 => {
            BridgeError::Timeout
        }
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            BridgeError::Desynchronized { transferred }
        }
        _ => BridgeError::Io(err),
    }
}
