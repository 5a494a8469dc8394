//! One measured echo round trip on a fresh connection.

use crate::protocol::{self, FrameError, CLIENT_CHUNK_SIZE};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

/// Why a session produced no sample.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("echo failed: {0}")]
    Frame(#[from] FrameError),
}

/// Where and how a session connects.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

/// Connect to `target`, send a `size`-byte filler frame and wait for the
/// full echo.
///
/// The connection is dropped (closed) on every return path, and is never
/// reused. Connection setup is not part of the measured time.
pub async fn run_session(target: &Target, size: u64) -> Result<Duration, SessionError> {
    let mut stream = connect(target).await?;
    measure_round_trip(&mut stream, size).await
}

async fn connect(target: &Target) -> Result<TcpStream, SessionError> {
    let stream = tokio::time::timeout(
        target.connect_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| SessionError::ConnectTimeout(target.connect_timeout))?
    .map_err(SessionError::Connect)?;

    if target.nodelay {
        stream.set_nodelay(true).map_err(SessionError::Connect)?;
    }
    Ok(stream)
}

/// Time one frame round trip on an already-open stream.
///
/// The clock starts right before the length prefix is written and stops
/// once the last echoed byte has been read and validated.
///
/// The echo is drained while the payload is still being written: the server
/// echoes as it reads, so a payload larger than both socket buffers would
/// otherwise stall both ends.
pub async fn measure_round_trip<S>(stream: &mut S, size: u64) -> Result<Duration, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let start = Instant::now();
    protocol::write_length(&mut writer, size).await?;
    let send = async {
        protocol::send_filler(&mut writer, size, CLIENT_CHUNK_SIZE).await?;
        trace!(size, "Payload sent");
        Ok::<_, FrameError>(())
    };
    let receive = protocol::receive_filler(&mut reader, size, CLIENT_CHUNK_SIZE);
    tokio::try_join!(send, receive)?;
    Ok(start.elapsed())
}
