//! TCP echo server.
//!
//! The accept loop pushes every accepted connection onto a bounded queue
//! drained by a fixed pool of echo workers. Each connection carries one
//! frame: the worker reads the length prefix, then echoes the payload back
//! chunk by chunk as it arrives, and closes the connection.
//!
//! On shutdown the accept loop stops, the queue is closed, and workers
//! finish every connection already queued before `serve` returns. A
//! connection that is still open when the grace period ends is dropped.

use crate::config::ServerConfig;
use crate::protocol::{self, FrameError, SERVER_CHUNK_SIZE};
use crate::shutdown::Shutdown;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

type ConnectionQueue = Arc<Mutex<mpsc::Receiver<(TcpStream, SocketAddr)>>>;

/// Server instance
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server { config }
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: Shutdown) -> io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Resolve and bind the listening socket with the configured backlog.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let addr = tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} did not resolve to any address", self.config.host),
                )
            })?;

        let listener = create_listener(addr, self.config.backlog)?;
        TcpListener::from_std(listener)
    }

    /// Accept connections on `listener` until `shutdown` fires, then drain.
    ///
    /// Connections still in flight when the grace period runs out are
    /// aborted, along with anything left in the queue.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: Shutdown) -> io::Result<()> {
        info!(
            address = %listener.local_addr()?,
            workers = self.config.concurrency,
            queue_depth = self.config.queue_depth,
            "Server listening"
        );

        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        let queue: ConnectionQueue = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker_id in 1..=self.config.concurrency {
            workers.spawn(worker_loop(worker_id, Arc::clone(&queue)));
        }
        drop(queue);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");
                        if !self.enqueue(&tx, stream, peer, &mut shutdown).await {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        drop(listener);
        drop(tx);

        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Echo worker panicked");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                remaining = workers.len(),
                "Aborting echo workers still busy after grace period"
            );
            workers.shutdown().await;
        }
        info!("Server stopped");

        Ok(())
    }

    /// Hand a connection to the worker pool, waiting for queue space unless
    /// shutdown fires first. Returns `false` when the accept loop should stop.
    async fn enqueue(
        &self,
        tx: &mpsc::Sender<(TcpStream, SocketAddr)>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &mut Shutdown,
    ) -> bool {
        tokio::select! {
            sent = tx.send((stream, peer)) => {
                if sent.is_err() {
                    error!("All echo workers have exited");
                    return false;
                }
                true
            }
            _ = shutdown.recv() => {
                info!(peer = %peer, "Stopping accept loop with a full queue");
                false
            }
        }
    }
}

async fn worker_loop(worker_id: usize, queue: ConnectionQueue) {
    loop {
        // The lock is held while waiting so idle workers queue up behind it.
        let next = queue.lock().await.recv().await;
        let Some((mut stream, peer)) = next else {
            debug!(worker = worker_id, "Queue closed, worker exiting");
            return;
        };

        debug!(worker = worker_id, peer = %peer, "Handling connection");
        match echo_frame(&mut stream).await {
            Ok(len) => {
                debug!(worker = worker_id, peer = %peer, bytes = len, "Echo complete");
            }
            Err(FrameError::ConnectionClosed { received, expected }) => {
                warn!(
                    worker = worker_id,
                    peer = %peer,
                    received,
                    expected,
                    "Client closed connection mid-frame"
                );
            }
            Err(e) => {
                warn!(worker = worker_id, peer = %peer, error = %e, "Failed to handle connection");
            }
        }
    }
}

/// Echo one frame on `stream` and close the write side.
///
/// Each chunk is written back before the next one is read, so memory use is
/// bounded by [`SERVER_CHUNK_SIZE`] regardless of the declared length.
/// Returns the number of payload bytes echoed.
pub async fn echo_frame<S>(stream: &mut S) -> Result<u64, FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let len = protocol::read_length(stream).await?;
    trace!(len, "Read length prefix");

    let mut buffer = BytesMut::zeroed(SERVER_CHUNK_SIZE);
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(SERVER_CHUNK_SIZE as u64) as usize;
        let n = stream.read(&mut buffer[..want]).await?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed {
                received: len - remaining,
                expected: len,
            });
        }
        protocol::send_payload(stream, &buffer[..n]).await?;
        remaining -= n as u64;
        trace!(echoed = n, remaining, "Echoed chunk");
    }

    stream.shutdown().await?;
    Ok(len)
}

/// Create a TCP listener with an explicit backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}
