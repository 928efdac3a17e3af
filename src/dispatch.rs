//! Routing of decoded inbound messages to per-variant callbacks. Each variant has one
//!  replaceable handler slot; a variant without a handler is dropped silently.
//!
//! Handlers are invoked from the engine's receive path and must not block it for long -
//!  anything non-trivial should be handed off (e.g. through a channel) so that
//!  acknowledgements and receive throughput do not stall.

use std::sync::RwLock;

use tracing::{debug, trace};

use crate::engine::InboundHandler;
use crate::packet::*;

type UnitHandler = Box<dyn Fn(PacketHeader) + Send + Sync>;
type DataHandler<T> = Box<dyn Fn(PacketHeader, T) + Send + Sync>;

#[derive(Default)]
struct HandlerSlots {
    sync_request: Option<DataHandler<SyncRequestData>>,
    sync_response: Option<DataHandler<SyncResponseData>>,
    config_request: Option<DataHandler<ConfigRequestData>>,
    config_response: Option<DataHandler<ConfigResponseData>>,
    gps: Option<DataHandler<GpsData>>,
    ping: Option<DataHandler<PingData>>,
    loc_est: Option<DataHandler<LocEstData>>,
    start_request: Option<UnitHandler>,
    start_response: Option<DataHandler<StartResponseData>>,
    stop_request: Option<UnitHandler>,
    stop_response: Option<DataHandler<StopResponseData>>,
    error: Option<UnitHandler>,
}

#[derive(Default)]
pub struct Dispatcher {
    slots: RwLock<HandlerSlots>,
}

macro_rules! data_handler_slot {
    ($register:ident, $unregister:ident, $slot:ident, $data:ty) => {
        pub fn $register(&self, handler: impl Fn(PacketHeader, $data) + Send + Sync + 'static) {
            self.slots.write().expect("handler lock poisoned").$slot = Some(Box::new(handler));
        }

        /// removes the handler; returns false if none was registered
        pub fn $unregister(&self) -> bool {
            self.slots.write().expect("handler lock poisoned").$slot.take().is_some()
        }
    };
}

macro_rules! unit_handler_slot {
    ($register:ident, $unregister:ident, $slot:ident) => {
        pub fn $register(&self, handler: impl Fn(PacketHeader) + Send + Sync + 'static) {
            self.slots.write().expect("handler lock poisoned").$slot = Some(Box::new(handler));
        }

        /// removes the handler; returns false if none was registered
        pub fn $unregister(&self) -> bool {
            self.slots.write().expect("handler lock poisoned").$slot.take().is_some()
        }
    };
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    data_handler_slot!(register_sync_request_handler, unregister_sync_request_handler, sync_request, SyncRequestData);
    data_handler_slot!(register_sync_response_handler, unregister_sync_response_handler, sync_response, SyncResponseData);
    data_handler_slot!(register_config_request_handler, unregister_config_request_handler, config_request, ConfigRequestData);
    data_handler_slot!(register_config_response_handler, unregister_config_response_handler, config_response, ConfigResponseData);
    data_handler_slot!(register_gps_handler, unregister_gps_handler, gps, GpsData);
    data_handler_slot!(register_ping_handler, unregister_ping_handler, ping, PingData);
    data_handler_slot!(register_loc_est_handler, unregister_loc_est_handler, loc_est, LocEstData);
    unit_handler_slot!(register_start_request_handler, unregister_start_request_handler, start_request);
    data_handler_slot!(register_start_response_handler, unregister_start_response_handler, start_response, StartResponseData);
    unit_handler_slot!(register_stop_request_handler, unregister_stop_request_handler, stop_request);
    data_handler_slot!(register_stop_response_handler, unregister_stop_response_handler, stop_response, StopResponseData);
    unit_handler_slot!(register_error_handler, unregister_error_handler, error);

    fn dispatch(&self, envelope: Envelope) {
        let header = envelope.header;
        let kind = envelope.message.kind();
        trace!("dispatching {:?} packet {}", kind, header.packet_id);

        let slots = self.slots.read().expect("handler lock poisoned");
        match envelope.message {
            // acknowledgements are consumed by the engine and never reach the facade
            RadioMessage::Ack { .. } => {}
            RadioMessage::SyncRequest(data) => invoke(&slots.sync_request, kind, header, data),
            RadioMessage::SyncResponse(data) => invoke(&slots.sync_response, kind, header, data),
            RadioMessage::ConfigRequest(data) => invoke(&slots.config_request, kind, header, data),
            RadioMessage::ConfigResponse(data) => invoke(&slots.config_response, kind, header, data),
            RadioMessage::Gps(data) => invoke(&slots.gps, kind, header, data),
            RadioMessage::Ping(data) => invoke(&slots.ping, kind, header, data),
            RadioMessage::LocationEstimate(data) => invoke(&slots.loc_est, kind, header, data),
            RadioMessage::StartRequest => invoke_unit(&slots.start_request, kind, header),
            RadioMessage::StartResponse(data) => invoke(&slots.start_response, kind, header, data),
            RadioMessage::StopRequest => invoke_unit(&slots.stop_request, kind, header),
            RadioMessage::StopResponse(data) => invoke(&slots.stop_response, kind, header, data),
            RadioMessage::Error => invoke_unit(&slots.error, kind, header),
        }
    }
}

fn invoke<T>(slot: &Option<DataHandler<T>>, kind: MessageKind, header: PacketHeader, data: T) {
    match slot {
        Some(handler) => handler(header, data),
        None => debug!("no handler registered for {:?} - dropping packet {}", kind, header.packet_id),
    }
}

fn invoke_unit(slot: &Option<UnitHandler>, kind: MessageKind, header: PacketHeader) {
    match slot {
        Some(handler) => handler(header),
        None => debug!("no handler registered for {:?} - dropping packet {}", kind, header.packet_id),
    }
}

#[async_trait::async_trait]
impl InboundHandler for Dispatcher {
    async fn on_envelope(&self, envelope: Envelope) {
        self.dispatch(envelope);
    }
}
