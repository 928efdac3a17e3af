//! Physical serial radio endpoint.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

use crate::error::LinkError;
use crate::link::RadioLink;

pub struct SerialLink {
    path: String,
    baud_rate: u32,
    port: Option<SerialStream>,
}

impl SerialLink {
    pub fn new(path: String, baud_rate: u32) -> SerialLink {
        SerialLink {
            path,
            baud_rate,
            port: None,
        }
    }
}

#[async_trait::async_trait]
impl RadioLink for SerialLink {
    async fn open(&mut self) -> Result<(), LinkError> {
        let port = tokio_serial::new(&self.path, self.baud_rate)
            .open_native_async()
            .map_err(|e| LinkError::Connect(format!("{} @ {} baud: {}", self.path, self.baud_rate, e)))?;

        info!("opened serial device {} at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    async fn read_with_timeout(&mut self, max_len: usize, timeout: Duration) -> Result<Bytes, LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotOpen)?;

        let mut buf = vec![0u8; max_len];
        match tokio::time::timeout(timeout, port.read(&mut buf)).await {
            Err(_) => Ok(Bytes::new()),
            Ok(Ok(0)) => {
                warn!("serial device {} reported end of stream", self.path);
                self.port = None;
                Err(LinkError::Disconnected)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf.into())
            }
            Ok(Err(e)) => {
                self.port = None;
                Err(LinkError::Io(e))
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotOpen)?;

        match port.write_all(buf).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.port = None;
                Err(LinkError::Io(e))
            }
        }
    }

    async fn close(&mut self) {
        // dropping the stream releases the device handle
        self.port = None;
    }
}
