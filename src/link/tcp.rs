//! TCP stand-in for the physical radio, used for testing without hardware. Client mode
//!  connects to a listening peer; server mode binds once and accepts one peer connection
//!  at a time, returning to listening when the peer goes away.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::TcpMode;
use crate::error::LinkError;
use crate::link::RadioLink;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

pub struct TcpLink {
    host: String,
    port: u16,
    mode: TcpMode,
    connect_timeout: Duration,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new(host: String, port: u16, mode: TcpMode, connect_timeout: Duration) -> TcpLink {
        TcpLink {
            host,
            port,
            mode,
            connect_timeout,
            listener: None,
            stream: None,
        }
    }

    async fn open_client(&mut self) -> Result<(), LinkError> {
        let addr = format!("{}:{}", self.host, self.port);
        let deadline = Instant::now() + self.connect_timeout;

        loop {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    info!("connected to simulated radio at {}", addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(LinkError::Connect(format!("{}: {}", addr, e)));
                    }
                    debug!("peer at {} not reachable yet ({}) - retrying", addr, e);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn open_server(&mut self) -> Result<(), LinkError> {
        if self.listener.is_none() {
            let addr = format!("{}:{}", self.host, self.port);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| LinkError::Connect(format!("bind {}: {}", addr, e)))?;
            info!("waiting for a peer connection on {}", addr);
            self.listener = Some(listener);
        }

        let listener = self.listener.as_ref().expect("listener was just initialized");
        let (stream, peer) = listener.accept().await.map_err(LinkError::Io)?;
        info!("peer connected from {}", peer);
        self.stream = Some(stream);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RadioLink for TcpLink {
    async fn open(&mut self) -> Result<(), LinkError> {
        match self.mode {
            TcpMode::Client => self.open_client().await,
            TcpMode::Server => self.open_server().await,
        }
    }

    async fn read_with_timeout(&mut self, max_len: usize, timeout: Duration) -> Result<Bytes, LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::NotOpen)?;

        let mut buf = vec![0u8; max_len];
        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => Ok(Bytes::new()),
            Ok(Ok(0)) => {
                warn!("peer closed the connection");
                self.stream = None;
                Err(LinkError::Disconnected)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf.into())
            }
            Ok(Err(e)) => {
                self.stream = None;
                Err(LinkError::Io(e))
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::NotOpen)?;

        match stream.write_all(buf).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stream = None;
                Err(LinkError::Io(e))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.listener = None;
    }
}
