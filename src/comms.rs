//! The top-level API of the crate: [DroneComms] wires a link, the reliable transport
//!  engine and the dispatch facade together and exposes a typed method per message
//!  variant for sending and for handler registration.
//!
//! Whether a send waits for an acknowledgement follows the variant's role: the requests
//!  of the sync / config / start / stop exchanges are acknowledged, responses and the
//!  periodic telemetry reports are fire-and-forget. [DroneComms::send] is the escape
//!  hatch when a caller needs to deviate from those defaults.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{AckPolicy, CommsConfig};
use crate::dispatch::Dispatcher;
use crate::engine::{ReliableLink, SessionState};
use crate::error::SendError;
use crate::link::build_link;
use crate::packet::*;

pub struct DroneComms {
    engine: ReliableLink,
    dispatcher: Arc<Dispatcher>,
}

macro_rules! data_variant_api {
    ($send:ident, $variant:ident, $data:ty, $need_ack:literal, $on:ident, $clear:ident, $register:ident, $unregister:ident) => {
        pub async fn $send(&self, data: $data) -> Result<PacketHeader, SendError> {
            self.engine.send(RadioMessage::$variant(data), $need_ack).await
        }

        pub fn $on(&self, handler: impl Fn(PacketHeader, $data) + Send + Sync + 'static) {
            self.dispatcher.$register(handler);
        }

        /// removes the handler; returns false if none was registered
        pub fn $clear(&self) -> bool {
            self.dispatcher.$unregister()
        }
    };
}

macro_rules! unit_variant_api {
    ($send:ident, $variant:ident, $need_ack:literal, $on:ident, $clear:ident, $register:ident, $unregister:ident) => {
        pub async fn $send(&self) -> Result<PacketHeader, SendError> {
            self.engine.send(RadioMessage::$variant, $need_ack).await
        }

        pub fn $on(&self, handler: impl Fn(PacketHeader) + Send + Sync + 'static) {
            self.dispatcher.$register(handler);
        }

        /// removes the handler; returns false if none was registered
        pub fn $clear(&self) -> bool {
            self.dispatcher.$unregister()
        }
    };
}

impl DroneComms {
    pub fn new(config: CommsConfig) -> DroneComms {
        let dispatcher = Arc::new(Dispatcher::new());
        let link = build_link(&config.link, config.connect_timeout);
        let engine = ReliableLink::new(link, dispatcher.clone(), config);

        DroneComms { engine, dispatcher }
    }

    /// Opens the link and starts the session. For a TCP server link this blocks until a
    ///  peer connects.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.engine.start().await
    }

    /// Closes the session, failing all in-flight acknowledged sends as cancelled.
    pub async fn stop(&self) {
        self.engine.stop().await
    }

    pub fn state(&self) -> SessionState {
        self.engine.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.engine.state_changes()
    }

    /// Sends a message with an explicit per-variant default override for `need_ack`.
    pub async fn send(&self, message: RadioMessage, need_ack: bool) -> Result<PacketHeader, SendError> {
        self.engine.send(message, need_ack).await
    }

    /// Sends an acknowledged message with an explicit timeout and retry budget.
    pub async fn send_with(&self, message: RadioMessage, policy: AckPolicy) -> Result<PacketHeader, SendError> {
        self.engine.send_with(message, policy).await
    }

    data_variant_api!(send_sync_request, SyncRequest, SyncRequestData, true,
        on_sync_request, clear_sync_request_handler,
        register_sync_request_handler, unregister_sync_request_handler);
    data_variant_api!(send_sync_response, SyncResponse, SyncResponseData, false,
        on_sync_response, clear_sync_response_handler,
        register_sync_response_handler, unregister_sync_response_handler);
    data_variant_api!(send_config_request, ConfigRequest, ConfigRequestData, true,
        on_config_request, clear_config_request_handler,
        register_config_request_handler, unregister_config_request_handler);
    data_variant_api!(send_config_response, ConfigResponse, ConfigResponseData, false,
        on_config_response, clear_config_response_handler,
        register_config_response_handler, unregister_config_response_handler);
    data_variant_api!(send_gps, Gps, GpsData, false,
        on_gps, clear_gps_handler,
        register_gps_handler, unregister_gps_handler);
    data_variant_api!(send_ping, Ping, PingData, false,
        on_ping, clear_ping_handler,
        register_ping_handler, unregister_ping_handler);
    data_variant_api!(send_location_estimate, LocationEstimate, LocEstData, false,
        on_location_estimate, clear_location_estimate_handler,
        register_loc_est_handler, unregister_loc_est_handler);
    unit_variant_api!(send_start_request, StartRequest, true,
        on_start_request, clear_start_request_handler,
        register_start_request_handler, unregister_start_request_handler);
    data_variant_api!(send_start_response, StartResponse, StartResponseData, false,
        on_start_response, clear_start_response_handler,
        register_start_response_handler, unregister_start_response_handler);
    unit_variant_api!(send_stop_request, StopRequest, true,
        on_stop_request, clear_stop_request_handler,
        register_stop_request_handler, unregister_stop_request_handler);
    data_variant_api!(send_stop_response, StopResponse, StopResponseData, false,
        on_stop_response, clear_stop_response_handler,
        register_stop_response_handler, unregister_stop_response_handler);
    unit_variant_api!(send_error, Error, false,
        on_error, clear_error_handler,
        register_error_handler, unregister_error_handler);
}
