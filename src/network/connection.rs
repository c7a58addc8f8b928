//! The single accepted peer connection
//!
//! A connection is split into a reader task, forwarding every socket read to
//! the server's event channel, and a writer task draining an outbound queue.
//! Both report end-of-stream and I/O failures back to the server, which
//! restarts itself.

use bytes::Bytes;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{TransportEvent, TransportServer};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection lost")]
    Lost,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Handle to the accepted peer connection
pub struct ClientConnection {
    /// Remote peer address
    addr: SocketAddr,
    /// Outbound frame queue
    outbound: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientConnection {
    /// Split the stream and start the reader and writer tasks
    pub(super) fn spawn(
        stream: TcpStream,
        addr: SocketAddr,
        generation: u64,
        read_buffer_size: usize,
        server: TransportServer,
        runtime: &Handle,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let reader = runtime.spawn(read_loop(
            read_half,
            generation,
            read_buffer_size,
            server.clone(),
        ));
        let writer = runtime.spawn(write_loop(write_half, outbound_rx, generation, server));

        Self {
            addr,
            outbound,
            reader,
            writer,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a frame for the writer task
    pub fn send(&self, data: Bytes) -> ConnectionResult<()> {
        self.outbound.send(data).map_err(|_| ConnectionError::Lost)
    }

    /// Abort both tasks, returning their handles so callers can wait for the
    /// socket to be released
    pub fn close(self) -> [JoinHandle<()>; 2] {
        self.reader.abort();
        self.writer.abort();
        [self.reader, self.writer]
    }
}

async fn read_loop(
    mut stream: OwnedReadHalf,
    generation: u64,
    read_buffer_size: usize,
    server: TransportServer,
) {
    let mut buf = vec![0u8; read_buffer_size.max(1)];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                server.restart_if_current(generation, "Connection closed by peer");
                break;
            }
            Ok(n) => {
                tracing::trace!("{} bytes received", n);
                server.emit(TransportEvent::DataReceived(Bytes::copy_from_slice(&buf[..n])));
            }
            Err(e) => {
                tracing::warn!("Data receive error: {}", e);
                server.restart_if_current(generation, "Data receive error");
                break;
            }
        }
    }
}

async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    generation: u64,
    server: TransportServer,
) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = stream.write_all(&data).await {
            tracing::warn!("Write to peer failed: {}", e);
            server.restart_if_current(generation, "Connection lost");
            break;
        }
        server.emit(TransportEvent::DataSent { len: data.len() });
    }
}
