mod wire;

use std::time::SystemTime;

use num_enum::{IntoPrimitive, TryFromPrimitive};


/// Header fields shared by every message variant. The packet id is unique per sender
///  session (monotonically assigned, wrapping at the u32 boundary), and the timestamp is
///  assigned by the sender when the message is handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_id: u32,
    pub need_ack: bool,
    pub timestamp_us: u64,
}

/// One message on the link: the common header plus exactly one typed variant. An empty
///  or unrecognized variant cannot be represented - decoding such bytes is an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: PacketHeader,
    pub message: RadioMessage,
}

/// The closed set of message variants carried over the link.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioMessage {
    /// signals successful receipt of the packet with the referenced id
    Ack { ack_id: u32 },
    SyncRequest(SyncRequestData),
    SyncResponse(SyncResponseData),
    ConfigRequest(ConfigRequestData),
    ConfigResponse(ConfigResponseData),
    Gps(GpsData),
    Ping(PingData),
    LocationEstimate(LocEstData),
    StartRequest,
    StartResponse(StartResponseData),
    StopRequest,
    StopResponse(StopResponseData),
    Error,
}

/// Wire discriminator for [RadioMessage] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    Ack = 0,
    SyncRequest = 1,
    SyncResponse = 2,
    ConfigRequest = 3,
    ConfigResponse = 4,
    Gps = 5,
    Ping = 6,
    LocationEstimate = 7,
    StartRequest = 8,
    StartResponse = 9,
    StopRequest = 10,
    StopResponse = 11,
    Error = 12,
}

impl RadioMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            RadioMessage::Ack { .. } => MessageKind::Ack,
            RadioMessage::SyncRequest(_) => MessageKind::SyncRequest,
            RadioMessage::SyncResponse(_) => MessageKind::SyncResponse,
            RadioMessage::ConfigRequest(_) => MessageKind::ConfigRequest,
            RadioMessage::ConfigResponse(_) => MessageKind::ConfigResponse,
            RadioMessage::Gps(_) => MessageKind::Gps,
            RadioMessage::Ping(_) => MessageKind::Ping,
            RadioMessage::LocationEstimate(_) => MessageKind::LocationEstimate,
            RadioMessage::StartRequest => MessageKind::StartRequest,
            RadioMessage::StartResponse(_) => MessageKind::StartResponse,
            RadioMessage::StopRequest => MessageKind::StopRequest,
            RadioMessage::StopResponse(_) => MessageKind::StopResponse,
            RadioMessage::Error => MessageKind::Error,
        }
    }
}

/// link handshake: proposes the ack timeout and retry budget the sender intends to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequestData {
    pub ack_timeout_ms: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponseData {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigRequestData {
    pub gain: f32,
    pub sampling_rate: u32,
    pub center_frequency: u32,
    pub run_num: u32,
    pub enable_test_data: bool,
    pub ping_width_ms: u32,
    pub ping_min_snr: u32,
    pub ping_max_len_mult: f32,
    pub ping_min_len_mult: f32,
    pub target_frequencies: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigResponseData {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpsData {
    pub easting: f64,
    pub northing: f64,
    pub altitude: f64,
    pub heading: f64,
    pub epsg_code: u32,
}

/// a single detected transmitter ping
#[derive(Debug, Clone, PartialEq)]
pub struct PingData {
    pub frequency: u32,
    pub amplitude: f64,
    pub easting: f64,
    pub northing: f64,
    pub altitude: f64,
    pub epsg_code: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocEstData {
    pub frequency: u32,
    pub easting: f64,
    pub northing: f64,
    pub epsg_code: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartResponseData {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopResponseData {
    pub success: bool,
}


/// current time as microseconds since the epoch, as carried in every packet header
pub fn timestamp_us_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
