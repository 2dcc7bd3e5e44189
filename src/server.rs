//! TCP server for prime requests.
//!
//! Accepts connections and hands every inbound chunk to the orchestrator on
//! its own task, so a slow computation never holds up other requests on the
//! same or other connections. Answers reach the client through one writer
//! task per connection, in completion order.

use crate::cache::CacheClient;
use crate::orchestrator::Orchestrator;
use crate::worker::Dispatcher;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Server instance
pub struct Server<C, D> {
    listener: TcpListener,
    orchestrator: Arc<Orchestrator<C, D>>,
}

impl<C: CacheClient, D: Dispatcher> Server<C, D> {
    /// Bind the listening socket
    pub async fn bind(addr: &str, orchestrator: Arc<Orchestrator<C, D>>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server {
            listener,
            orchestrator,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> std::io::Result<()> {
        info!(address = %self.local_addr()?, "Serving");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Peer connected");
                    let orchestrator = Arc::clone(&self.orchestrator);
                    tokio::spawn(handle_connection(stream, peer, orchestrator));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Handle a single client connection.
///
/// Requests still in flight when the peer closes are not cancelled. They run
/// to completion and their answers are dropped if the writer is gone.
async fn handle_connection<C: CacheClient, D: Dispatcher>(
    stream: TcpStream,
    peer: SocketAddr,
    orchestrator: Arc<Orchestrator<C, D>>,
) {
    let (mut reader, writer) = stream.into_split();
    let (responses, pending) = mpsc::unbounded_channel();
    tokio::spawn(write_responses(writer, pending, peer));

    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buffer.reserve(BUFFER_SIZE);

        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                info!(peer = %peer, "Connection closed");
                break;
            }
            Ok(n) => {
                trace!(peer = %peer, bytes = n, "Chunk received");
                let chunk = buffer.split().freeze();
                let orchestrator = Arc::clone(&orchestrator);
                let responses = responses.clone();

                tokio::spawn(async move {
                    match orchestrator.handle(&chunk).await {
                        Ok(answer) => {
                            if responses.send(answer.response_line()).is_err() {
                                debug!(peer = %peer, %answer, "Writer gone, dropping answer");
                            }
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "Request failed"),
                    }
                });
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Connection error");
                break;
            }
        }
    }
}

/// Write answers back until every request holding a sender has finished
async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut pending: mpsc::UnboundedReceiver<Bytes>,
    peer: SocketAddr,
) {
    while let Some(line) = pending.recv().await {
        if let Err(e) = writer.write_all(&line).await {
            warn!(peer = %peer, error = %e, "Failed to write response");
        }
    }

    if let Err(e) = writer.shutdown().await {
        trace!(peer = %peer, error = %e, "Shutdown after close");
    }
}
