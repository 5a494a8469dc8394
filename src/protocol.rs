//! Length-prefixed framing shared by the echo server and the load generator.
//!
//! Every request is a single frame on a fresh TCP connection:
//!
//! ```text
//! +------------------------------+--------------------------------+
//! | length: u64, big-endian (8B) | payload: exactly `length` bytes |
//! +------------------------------+--------------------------------+
//! ```
//!
//! The server answers with the payload only (no prefix), echoed verbatim and
//! possibly split differently than it was sent. The prefix is fixed-width, so
//! there is nothing to escape.
//!
//! Stream sockets may accept or return fewer bytes than asked for on any
//! call. Every helper here loops until its byte count is satisfied and turns
//! a zero-length read into [`FrameError::ConnectionClosed`].

use bytes::BytesMut;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Size of the length prefix on the wire.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Byte value used to fill benchmark payloads.
pub const FILLER: u8 = 0x42;

/// Chunk size the load generator writes and reads with.
pub const CLIENT_CHUNK_SIZE: usize = 32 * 1024;

/// Chunk size the echo server reads (and echoes) with.
pub const SERVER_CHUNK_SIZE: usize = 64 * 1024;

/// Framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer closed the stream before the expected byte count arrived.
    #[error("connection closed after {received} of {expected} bytes")]
    ConnectionClosed { received: u64, expected: u64 },

    /// An echoed byte did not match the payload that was sent.
    #[error("byte {offset} was {found:#04x}, expected {expected:#04x}")]
    Mismatch { offset: u64, found: u8, expected: u8 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encode a payload length as the 8-byte wire prefix.
pub fn encode_length(len: u64) -> [u8; LENGTH_PREFIX_LEN] {
    len.to_be_bytes()
}

/// Decode the 8-byte wire prefix into a payload length.
pub fn decode_length(bytes: [u8; LENGTH_PREFIX_LEN]) -> u64 {
    u64::from_be_bytes(bytes)
}

/// Write all of `payload`, issuing as many partial writes as the stream needs.
pub async fn send_payload<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;
    while sent < payload.len() {
        let n = writer.write(&payload[sent..]).await?;
        if n == 0 {
            let stalled = io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting bytes");
            return Err(stalled.into());
        }
        trace!(sent = n, remaining = payload.len() - sent - n, "partial write");
        sent += n;
    }
    Ok(())
}

/// Read exactly `len` bytes into a fresh buffer.
///
/// A stream that ends early yields [`FrameError::ConnectionClosed`] with the
/// number of bytes that did arrive.
pub async fn receive_payload<R>(reader: &mut R, len: usize) -> Result<BytesMut, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::zeroed(len);
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed {
                received: filled as u64,
                expected: len as u64,
            });
        }
        filled += n;
    }
    Ok(buf)
}

/// Write the length prefix for a frame of `len` payload bytes.
pub async fn write_length<W>(writer: &mut W, len: u64) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    send_payload(writer, &encode_length(len)).await
}

/// Read a length prefix.
///
/// A stream that ends before all 8 bytes arrive yields
/// [`FrameError::ConnectionClosed`].
pub async fn read_length<R>(reader: &mut R) -> Result<u64, FrameError>
where
    R: AsyncRead + Unpin,
{
    let buf = receive_payload(reader, LENGTH_PREFIX_LEN).await?;
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&buf);
    Ok(decode_length(prefix))
}

/// Stream `len` filler bytes in chunks of at most `chunk_size`.
pub async fn send_filler<W>(writer: &mut W, len: u64, chunk_size: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let chunk = vec![FILLER; chunk_size.max(1)];
    let mut remaining = len;
    while remaining > 0 {
        let this_chunk = remaining.min(chunk.len() as u64) as usize;
        send_payload(writer, &chunk[..this_chunk]).await?;
        remaining -= this_chunk as u64;
    }
    writer.flush().await?;
    Ok(())
}

/// Receive `len` bytes in chunks of at most `chunk_size`, checking that every
/// byte equals [`FILLER`].
///
/// Never reads past `len`, so any bytes the peer sends beyond the frame stay
/// in the socket.
pub async fn receive_filler<R>(
    reader: &mut R,
    len: u64,
    chunk_size: usize,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut received = 0u64;
    while received < len {
        let want = (len - received).min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed {
                received,
                expected: len,
            });
        }
        if let Some(pos) = buf[..n].iter().position(|&b| b != FILLER) {
            return Err(FrameError::Mismatch {
                offset: received + pos as u64,
                found: buf[pos],
                expected: FILLER,
            });
        }
        trace!(received = n, remaining = len - received - n as u64, "partial read");
        received += n as u64;
    }
    Ok(())
}
