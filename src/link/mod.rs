pub mod serial;
pub mod tcp;

use std::time::Duration;

use bytes::Bytes;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::link::serial::SerialLink;
use crate::link::tcp::TcpLink;


/// A byte-stream endpoint the engine talks through - a physical serial radio or a
///  TCP-based stand-in for it. Short reads and writes are normal for both kinds; a lost
///  connection is reported as a [LinkError] so the engine can reconnect instead of
///  treating it as a decode anomaly.
#[async_trait::async_trait]
pub trait RadioLink: Send {
    /// Opens (or re-opens) the endpoint. The engine calls this once during `start()` -
    ///  where a failure is fatal - and again after connection loss.
    async fn open(&mut self) -> Result<(), LinkError>;

    /// Reads whatever is available, up to `max_len` bytes, waiting at most `timeout`.
    ///  Returns an empty buffer on timeout; never blocks past the timeout.
    async fn read_with_timeout(&mut self, max_len: usize, timeout: Duration) -> Result<Bytes, LinkError>;

    async fn write(&mut self, buf: &[u8]) -> Result<(), LinkError>;

    async fn close(&mut self);
}

pub fn build_link(config: &LinkConfig, connect_timeout: Duration) -> Box<dyn RadioLink> {
    match config {
        LinkConfig::Serial { path, baud_rate } => {
            Box::new(SerialLink::new(path.clone(), *baud_rate))
        }
        LinkConfig::Tcp { host, port, mode } => {
            Box::new(TcpLink::new(host.clone(), *port, *mode, connect_timeout))
        }
    }
}
