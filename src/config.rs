use std::time::Duration;

/// Which kind of endpoint the engine talks through, with per-kind parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkConfig {
    Serial {
        path: String,
        baud_rate: u32,
    },
    Tcp {
        host: String,
        port: u16,
        mode: TcpMode,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpMode {
    /// connect to a listening peer, backing off until it is reachable
    Client,
    /// bind and accept exactly one peer connection at a time
    Server,
}

/// Engine-level configuration. The ack timeout and retry count are defaults that can be
///  overridden per send call.
#[derive(Debug, Clone)]
pub struct CommsConfig {
    pub link: LinkConfig,

    /// how long to wait for an acknowledgement before retransmitting
    pub ack_timeout: Duration,
    /// how many retransmissions before a send is reported as failed
    pub max_retries: u32,

    /// upper bound for a single blocking read on the link. This is also the engine's
    ///  cancellation granularity - `stop()` takes at most roughly this long to be observed
    ///  by the receive path.
    pub read_timeout: Duration,
    /// cadence of the retry sweep
    pub sweep_interval: Duration,

    /// largest accepted frame payload; longer declared lengths are treated as
    ///  desynchronization on the inbound side and rejected before transmission on the
    ///  outbound side
    pub max_payload: usize,
    /// how many recently seen inbound packet ids are kept for duplicate suppression
    pub seen_id_capacity: usize,

    /// initial delay between reconnection attempts after link loss
    pub reconnect_backoff_min: Duration,
    /// ceiling for the exponential reconnection backoff
    pub reconnect_backoff_max: Duration,
    /// how long a TCP client keeps trying to reach the peer during `start()`
    pub connect_timeout: Duration,
}

impl Default for CommsConfig {
    fn default() -> Self {
        CommsConfig {
            link: LinkConfig::Tcp {
                host: "localhost".to_string(),
                port: 50000,
                mode: TcpMode::Client,
            },
            ack_timeout: Duration::from_secs(2),
            max_retries: 5,
            read_timeout: Duration::from_millis(100),
            sweep_interval: Duration::from_millis(100),
            max_payload: 8 * 1024,
            seen_id_capacity: 1024,
            reconnect_backoff_min: Duration::from_millis(250),
            reconnect_backoff_max: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl CommsConfig {
    pub fn with_link(link: LinkConfig) -> Self {
        CommsConfig {
            link,
            ..Default::default()
        }
    }
}

/// Per-send override of the engine's acknowledgement defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    pub ack_timeout: Duration,
    pub max_retries: u32,
}

impl AckPolicy {
    pub fn from_config(config: &CommsConfig) -> AckPolicy {
        AckPolicy {
            ack_timeout: config.ack_timeout,
            max_retries: config.max_retries,
        }
    }
}
