//! The I/O boundary a [`crate::handler::ProtocolHandler`] drives. Kept as a
//! trait object (rather than a generic parameter threaded through the
//! handler and table) so a [`crate::table::ConnectionTable`] can hold a
//! uniform collection of connections regardless of what's underneath them —
//! a real TCP socket, an in-memory pipe for tests, or eventually a
//! multiplexed transport.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{LevinError, LevinResult};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> LevinResult<()>;

    /// Reads at least one byte into `buf`, returning the count read, or `0`
    /// on orderly peer shutdown.
    async fn recv(&self, buf: &mut [u8]) -> LevinResult<usize>;

    async fn close(&self);
}

/// Default transport: a plain, un-encrypted TCP socket. TLS/SSL transport
/// specifics are out of scope here; an embedding application that needs
/// encryption supplies its own [`Transport`] impl wrapping whatever stream
/// type terminates it.
pub struct TcpTransport {
    reader: Mutex<tokio::net::tcp::OwnedReadHalf>,
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        TcpTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, bytes: Vec<u8>) -> LevinResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(LevinError::from)
    }

    async fn recv(&self, buf: &mut [u8]) -> LevinResult<usize> {
        let mut reader = self.reader.lock().await;
        reader.read(buf).await.map_err(LevinError::from)
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
