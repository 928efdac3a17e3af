pub mod codec;
pub mod comms;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod link;
pub mod packet;
pub mod registry;

pub use comms::DroneComms;
pub use config::{CommsConfig, LinkConfig, TcpMode};
