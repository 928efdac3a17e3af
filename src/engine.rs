//! The reliable transport engine. It owns the link and the packet registry for the
//!  lifetime of a session and coordinates three activities:
//!
//!  * a link task that owns the transport - it runs the continuous receive path
//!    (bounded-timeout reads feeding the streaming frame decoder) and is the single
//!    write path for explicit sends, ack replies and retransmissions
//!  * a retry sweep that fires on a fixed interval, independent of the receive cadence
//!  * any number of concurrent `send()` callers, which block on a completion signal when
//!    they requested an acknowledgement
//!
//! On link loss the session drops back to `Opening` and reconnects with exponential
//!  backoff; pending acknowledgement-requiring sends survive the reconnect and keep
//!  being retried once the link is back.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::codec::{encode_frame, FrameDecoder};
use crate::config::{AckPolicy, CommsConfig};
use crate::error::SendError;
use crate::link::RadioLink;
use crate::packet::{timestamp_us_now, Envelope, PacketHeader, RadioMessage};
use crate::registry::{PacketRegistry, SendOutcome};

/// how many bytes a single link read asks for at most
const READ_CHUNK_LEN: usize = 4096;
/// backlog of frames waiting for the link task's write path
const WRITE_QUEUE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
}

/// Seam between the engine's receive path and whatever consumes decoded messages -
///  normally the [crate::dispatch::Dispatcher] facade.
///
/// This is a blocking call on the receive path: implementations must be quick and hand
///  off non-trivial work, or acks and receive throughput stall.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_envelope(&self, envelope: Envelope);
}

pub struct ReliableLink {
    shared: Arc<Shared>,
    /// consumed by `start()`, handed to the link task
    link_slot: Mutex<Option<Box<dyn RadioLink>>>,
    write_rx_slot: Mutex<Option<mpsc::Receiver<Bytes>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    config: CommsConfig,
    registry: Mutex<PacketRegistry>,
    write_tx: mpsc::Sender<Bytes>,
    state_tx: watch::Sender<SessionState>,
    handler: Arc<dyn InboundHandler>,
}

impl ReliableLink {
    pub fn new(link: Box<dyn RadioLink>, handler: Arc<dyn InboundHandler>, config: CommsConfig) -> ReliableLink {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_LEN);
        let (state_tx, _) = watch::channel(SessionState::Closed);
        let (shutdown_tx, _) = watch::channel(false);

        ReliableLink {
            shared: Arc::new(Shared {
                registry: Mutex::new(PacketRegistry::new(config.seen_id_capacity)),
                config,
                write_tx,
                state_tx,
                handler,
            }),
            link_slot: Mutex::new(Some(link)),
            write_rx_slot: Mutex::new(Some(write_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Opens the link and starts the receive and retry loops. Idempotent if the session
    ///  is already open; fatal conditions (unparseable device, malformed address) are
    ///  reported here rather than silently retried forever.
    pub async fn start(&self) -> anyhow::Result<()> {
        if *self.shutdown_tx.borrow() {
            bail!("session was stopped - a stopped session cannot be restarted");
        }
        if self.state() != SessionState::Closed {
            debug!("session already started");
            return Ok(());
        }

        let mut link_slot = self.link_slot.lock().await;
        let mut link = match link_slot.take() {
            Some(link) => link,
            None => {
                debug!("session already started");
                return Ok(());
            }
        };

        // subscribed before the open so a stop() racing it is observed below
        let mut link_shutdown_rx = self.shutdown_tx.subscribe();
        let sweep_shutdown_rx = self.shutdown_tx.subscribe();

        self.shared.state_tx.send_replace(SessionState::Opening);

        // opening can block for a long time (a server link waits for its peer), so it
        //  must not keep a concurrent stop() from taking effect
        let opened = tokio::select! {
            _ = wait_for_shutdown(&mut link_shutdown_rx) => None,
            opened = link.open() => Some(opened),
        };
        let opened = match opened {
            Some(opened) => opened,
            None => {
                self.shared.state_tx.send_replace(SessionState::Closed);
                *link_slot = Some(link);
                bail!("session was stopped while the link was opening");
            }
        };
        if let Err(e) = opened {
            self.shared.state_tx.send_replace(SessionState::Closed);
            *link_slot = Some(link);
            return Err(anyhow!("failed to open link: {}", e));
        }

        let mut tasks = self.tasks.lock().await;
        if *link_shutdown_rx.borrow() {
            // stop() won the race against the link coming up
            link.close().await;
            self.shared.state_tx.send_replace(SessionState::Closed);
            bail!("session was stopped while the link was opening");
        }

        let write_rx = self.write_rx_slot.lock().await
            .take()
            .expect("write queue receiver is taken together with the link");

        tasks.push(tokio::spawn(run_link_task(
            self.shared.clone(),
            link,
            write_rx,
            link_shutdown_rx,
        )));
        tasks.push(tokio::spawn(run_sweep_task(
            self.shared.clone(),
            sweep_shutdown_rx,
        )));
        self.shared.state_tx.send_replace(SessionState::Open);
        info!("session open");

        Ok(())
    }

    /// Tears the session down: stops both loops, closes the link and fails every pending
    ///  send as cancelled. Terminal - the session cannot be started again.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("session task ended abnormally: {}", e);
            }
        }

        let waiters = self.shared.registry.lock().await.drain_pending();
        for waiter in waiters {
            let _ = waiter.send(SendOutcome::Cancelled);
        }

        self.shared.state_tx.send_replace(SessionState::Closed);
        info!("session closed");
    }

    /// Sends a message. With `need_ack` the call blocks until the peer acknowledges it,
    ///  the retry budget is exhausted, or the session is stopped; without it the message
    ///  is enqueued fire-and-forget. Returns the header assigned to the message.
    pub async fn send(&self, message: RadioMessage, need_ack: bool) -> Result<PacketHeader, SendError> {
        if need_ack {
            self.send_with(message, AckPolicy::from_config(&self.shared.config)).await
        } else {
            let (header, frame) = self.encode_outgoing(message, false).await?;
            self.shared.write_tx.send(frame).await.map_err(|_| SendError::Cancelled)?;
            Ok(header)
        }
    }

    /// Like [ReliableLink::send] with `need_ack`, but with an explicit per-call override
    ///  of the ack timeout and retry budget.
    pub async fn send_with(&self, message: RadioMessage, policy: AckPolicy) -> Result<PacketHeader, SendError> {
        let (done_tx, done_rx) = oneshot::channel();

        let (header, frame) = {
            let mut registry = self.shared.registry.lock().await;
            let header = PacketHeader {
                packet_id: registry.next_outgoing_id(),
                need_ack: true,
                timestamp_us: timestamp_us_now(),
            };
            let frame = encode_envelope(&self.shared.config, header, &message)?;
            registry.register_pending(header.packet_id, frame.clone(), policy.ack_timeout, policy.max_retries, done_tx);
            (header, frame)
        };

        if self.shared.write_tx.send(frame).await.is_err() {
            // the link task is gone; clean up our record in case stop() drained already
            if let Some(waiter) = self.shared.registry.lock().await.cancel_pending(header.packet_id) {
                drop(waiter);
            }
            return Err(SendError::Cancelled);
        }

        match done_rx.await {
            Ok(SendOutcome::Acked) => Ok(header),
            Ok(SendOutcome::AckTimeout) => Err(SendError::AckTimeout),
            Ok(SendOutcome::Cancelled) | Err(_) => Err(SendError::Cancelled),
        }
    }

    async fn encode_outgoing(&self, message: RadioMessage, need_ack: bool) -> Result<(PacketHeader, Bytes), SendError> {
        let mut registry = self.shared.registry.lock().await;
        let header = PacketHeader {
            packet_id: registry.next_outgoing_id(),
            need_ack,
            timestamp_us: timestamp_us_now(),
        };
        let frame = encode_envelope(&self.shared.config, header, &message)?;
        Ok((header, frame))
    }
}

fn encode_envelope(config: &CommsConfig, header: PacketHeader, message: &RadioMessage) -> Result<Bytes, SendError> {
    let envelope = Envelope {
        header,
        message: message.clone(),
    };
    let mut payload = BytesMut::new();
    envelope.ser(&mut payload);
    Ok(encode_frame(&payload, config.max_payload)?)
}

/// Completes once the shutdown flag is set - also when it was already set before the
///  call, which a bare `changed()` would miss.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_link_task(
    shared: Arc<Shared>,
    mut link: Box<dyn RadioLink>,
    mut write_rx: mpsc::Receiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut decoder = FrameDecoder::new(shared.config.max_payload);

    'session: while !*shutdown_rx.borrow() {
        // flush queued writes - explicit sends and retransmissions share this one path
        loop {
            match write_rx.try_recv() {
                Ok(frame) => {
                    if let Err(e) = link.write(&frame).await {
                        warn!("link write failed: {}", e);
                        // the frame is lost here; if it is tracked for ack the sweep
                        //  retransmits it after the link is back
                        if !reopen_link(&shared, link.as_mut(), &mut shutdown_rx).await {
                            break 'session;
                        }
                        decoder.reset();
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break 'session,
            }
        }

        match link.read_with_timeout(READ_CHUNK_LEN, shared.config.read_timeout).await {
            Ok(chunk) => {
                if chunk.is_empty() {
                    continue;
                }
                trace!("received {} raw bytes", chunk.len());
                decoder.push(&chunk);
                while let Some(envelope) = decoder.next_envelope() {
                    process_inbound(&shared, envelope, link.as_mut()).await;
                }
            }
            Err(e) => {
                warn!("link read failed: {}", e);
                if !reopen_link(&shared, link.as_mut(), &mut shutdown_rx).await {
                    break 'session;
                }
                decoder.reset();
            }
        }
    }

    link.close().await;
    debug!("link task stopped");
}

async fn process_inbound(shared: &Arc<Shared>, envelope: Envelope, link: &mut dyn RadioLink) {
    if let RadioMessage::Ack { ack_id } = envelope.message {
        shared.registry.lock().await.on_ack_received(ack_id);
        return;
    }

    let header = envelope.header;
    let (duplicate, ack_frame) = {
        let mut registry = shared.registry.lock().await;
        let duplicate = registry.is_duplicate(header.packet_id);

        // Acks are synthesized even for duplicates: a retransmission means our previous
        //  ack did not make it. The ack itself never requests an ack.
        let ack_frame = if header.need_ack {
            let ack = Envelope {
                header: PacketHeader {
                    packet_id: registry.next_outgoing_id(),
                    need_ack: false,
                    timestamp_us: timestamp_us_now(),
                },
                message: RadioMessage::Ack { ack_id: header.packet_id },
            };
            let mut payload = BytesMut::new();
            ack.ser(&mut payload);
            encode_frame(&payload, shared.config.max_payload).ok()
        } else {
            None
        };
        (duplicate, ack_frame)
    };

    if let Some(frame) = ack_frame {
        trace!("acknowledging packet {}", header.packet_id);
        if let Err(e) = link.write(&frame).await {
            // the peer will retransmit; the next loop iteration reconnects
            warn!("failed to send ack for packet {}: {}", header.packet_id, e);
        }
    }

    if duplicate {
        debug!("dropping duplicate delivery of packet {}", header.packet_id);
        return;
    }

    shared.handler.on_envelope(envelope).await;
}

/// Reconnects after link loss with exponential backoff, keeping the session in `Opening`
///  until the link is back. Returns false if shutdown was requested while reconnecting.
async fn reopen_link(shared: &Arc<Shared>, link: &mut dyn RadioLink, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    shared.state_tx.send_replace(SessionState::Opening);

    let mut backoff = shared.config.reconnect_backoff_min;
    loop {
        if *shutdown_rx.borrow() {
            return false;
        }

        let reopened = tokio::select! {
            _ = shutdown_rx.changed() => return false,
            reopened = link.open() => reopened,
        };

        match reopened {
            Ok(()) => {
                info!("link re-established");
                shared.state_tx.send_replace(SessionState::Open);
                return true;
            }
            Err(e) => {
                debug!("reconnect attempt failed: {} - next attempt in {:?}", e, backoff);
                tokio::select! {
                    _ = shutdown_rx.changed() => return false,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(shared.config.reconnect_backoff_max);
            }
        }
    }
}

async fn run_sweep_task(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            _ = ticker.tick() => {}
        }

        let swept = shared.registry.lock().await.sweep_expired(Instant::now());

        for frame in swept.retransmit {
            if let Err(e) = shared.write_tx.try_send(frame) {
                // queue full or link task gone - the record stays armed, the next sweep
                //  picks it up again
                debug!("retransmission deferred: {}", e);
            }
        }
        for waiter in swept.failed {
            let _ = waiter.send(SendOutcome::AckTimeout);
        }
    }

    debug!("retry sweep stopped");
}


#[cfg(test)]
mod test {
    use std::time::Duration;

    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::{TcpListener, TcpStream};

    use crate::config::{LinkConfig, TcpMode};
    use crate::error::LinkError;
    use crate::link::tcp::TcpLink;
    use crate::packet::{GpsData, SyncRequestData};

    use super::*;

    /// In-memory stand-in for a radio link, the peer side being a raw [DuplexStream].
    ///  After link loss, re-opening hands out the next stream from the replacement
    ///  channel, so a test can play the role of a peer that comes back.
    struct DuplexLink {
        io: Option<DuplexStream>,
        replacements: Option<mpsc::UnboundedReceiver<DuplexStream>>,
    }

    #[async_trait::async_trait]
    impl RadioLink for DuplexLink {
        async fn open(&mut self) -> Result<(), LinkError> {
            if self.io.is_some() {
                return Ok(());
            }
            let replacements = self.replacements.as_mut().ok_or(LinkError::NotOpen)?;
            match replacements.recv().await {
                Some(io) => {
                    self.io = Some(io);
                    Ok(())
                }
                None => Err(LinkError::NotOpen),
            }
        }

        async fn read_with_timeout(&mut self, max_len: usize, timeout: Duration) -> Result<Bytes, LinkError> {
            let io = self.io.as_mut().ok_or(LinkError::NotOpen)?;
            let mut buf = vec![0u8; max_len];
            match tokio::time::timeout(timeout, io.read(&mut buf)).await {
                Err(_) => Ok(Bytes::new()),
                Ok(Ok(0)) => {
                    self.io = None;
                    Err(LinkError::Disconnected)
                }
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    Ok(buf.into())
                }
                Ok(Err(e)) => {
                    self.io = None;
                    Err(LinkError::Io(e))
                }
            }
        }

        async fn write(&mut self, buf: &[u8]) -> Result<(), LinkError> {
            let io = self.io.as_mut().ok_or(LinkError::NotOpen)?;
            io.write_all(buf).await.map_err(LinkError::Io)
        }

        async fn close(&mut self) {
            self.io = None;
        }
    }

    struct RecordingHandler {
        tx: mpsc::UnboundedSender<Envelope>,
    }

    #[async_trait::async_trait]
    impl InboundHandler for RecordingHandler {
        async fn on_envelope(&self, envelope: Envelope) {
            let _ = self.tx.send(envelope);
        }
    }

    fn test_config() -> CommsConfig {
        CommsConfig {
            ack_timeout: Duration::from_millis(100),
            max_retries: 3,
            read_timeout: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(10),
            reconnect_backoff_min: Duration::from_millis(10),
            reconnect_backoff_max: Duration::from_millis(50),
            ..CommsConfig::with_link(LinkConfig::Serial { path: "unused".to_string(), baud_rate: 57600 })
        }
    }

    fn engine(config: CommsConfig) -> (ReliableLink, DuplexStream, mpsc::UnboundedReceiver<Envelope>) {
        let (ours, peer) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = ReliableLink::new(
            Box::new(DuplexLink { io: Some(ours), replacements: None }),
            Arc::new(RecordingHandler { tx }),
            config,
        );
        (engine, peer, rx)
    }

    async fn read_envelope(peer: &mut DuplexStream, decoder: &mut FrameDecoder) -> Envelope {
        loop {
            if let Some(envelope) = decoder.next_envelope() {
                return envelope;
            }
            let mut buf = [0u8; 1024];
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer side closed unexpectedly");
            decoder.push(&buf[..n]);
        }
    }

    fn frame_of(envelope: &Envelope) -> Bytes {
        let mut payload = BytesMut::new();
        envelope.ser(&mut payload);
        encode_frame(&payload, 8 * 1024).unwrap()
    }

    fn ack_frame(ack_id: u32) -> Bytes {
        frame_of(&Envelope {
            header: PacketHeader { packet_id: 9000, need_ack: false, timestamp_us: 1 },
            message: RadioMessage::Ack { ack_id },
        })
    }

    fn gps_message() -> RadioMessage {
        RadioMessage::Gps(GpsData {
            easting: 500_000.0,
            northing: 4_100_000.0,
            altitude: 100.0,
            heading: 90.0,
            epsg_code: 32611,
        })
    }

    fn sync_request_envelope(packet_id: u32) -> Envelope {
        Envelope {
            header: PacketHeader { packet_id, need_ack: true, timestamp_us: 5 },
            message: RadioMessage::SyncRequest(SyncRequestData { ack_timeout_ms: 500, max_retries: 3 }),
        }
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_fire_and_forget_send_reaches_peer() {
        let (engine, mut peer, _inbound) = engine(test_config());
        engine.start().await.unwrap();

        let header = engine.send(gps_message(), false).await.unwrap();
        assert!(!header.need_ack);

        let mut decoder = FrameDecoder::new(8 * 1024);
        let received = read_envelope(&mut peer, &mut decoder).await;
        assert_eq!(received.header.packet_id, header.packet_id);
        assert_eq!(received.message, gps_message());

        engine.stop().await;
        assert_eq!(engine.state(), SessionState::Closed);
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_send_with_ack_resolves_on_ack() {
        let (engine, mut peer, _inbound) = engine(test_config());
        engine.start().await.unwrap();

        let peer_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(8 * 1024);
            let received = read_envelope(&mut peer, &mut decoder).await;
            assert!(received.header.need_ack);
            peer.write_all(&ack_frame(received.header.packet_id)).await.unwrap();
            peer
        });

        let header = engine.send(gps_message(), true).await.unwrap();
        assert!(header.need_ack);
        assert_eq!(engine.shared.registry.lock().await.num_pending(), 0);

        peer_task.await.unwrap();
        engine.stop().await;
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_lost_ack_triggers_retransmission() {
        let (engine, mut peer, _inbound) = engine(test_config());
        engine.start().await.unwrap();

        let peer_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(8 * 1024);
            let first = read_envelope(&mut peer, &mut decoder).await;
            // drop the first transmission's ack; ack the retransmission
            let second = read_envelope(&mut peer, &mut decoder).await;
            assert_eq!(second, first);
            peer.write_all(&ack_frame(second.header.packet_id)).await.unwrap();
            peer
        });

        engine.send(gps_message(), true).await.unwrap();

        peer_task.await.unwrap();
        engine.stop().await;
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_retry_exhaustion_fails_after_all_transmissions() {
        let (engine, mut peer, _inbound) = engine(test_config());
        engine.start().await.unwrap();

        let peer_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(8 * 1024);
            let mut transmissions = Vec::new();
            loop {
                tokio::select! {
                    envelope = read_envelope(&mut peer, &mut decoder) => transmissions.push(envelope),
                    _ = tokio::time::sleep(Duration::from_millis(600)) => return transmissions,
                }
            }
        });

        let started = Instant::now();
        let result = engine.send(gps_message(), true).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(SendError::AckTimeout)));
        // initial transmission plus max_retries retransmissions, each ack_timeout apart
        assert!(elapsed >= Duration::from_millis(300), "failed too early: {:?}", elapsed);

        let transmissions = peer_task.await.unwrap();
        assert_eq!(transmissions.len(), 4);
        assert!(transmissions.windows(2).all(|w| w[0] == w[1]));

        engine.stop().await;
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_inbound_need_ack_is_acked_and_dispatched() {
        let (engine, mut peer, mut inbound) = engine(test_config());
        engine.start().await.unwrap();

        peer.write_all(&frame_of(&sync_request_envelope(7))).await.unwrap();

        let mut decoder = FrameDecoder::new(8 * 1024);
        let ack = read_envelope(&mut peer, &mut decoder).await;
        assert_eq!(ack.message, RadioMessage::Ack { ack_id: 7 });
        assert!(!ack.header.need_ack);

        let dispatched = inbound.recv().await.unwrap();
        assert_eq!(dispatched, sync_request_envelope(7));

        engine.stop().await;
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_duplicate_is_reacked_but_dispatched_once() {
        let (engine, mut peer, mut inbound) = engine(test_config());
        engine.start().await.unwrap();

        let frame = frame_of(&sync_request_envelope(7));
        peer.write_all(&frame).await.unwrap();
        peer.write_all(&frame).await.unwrap();

        let mut decoder = FrameDecoder::new(8 * 1024);
        for _ in 0..2 {
            let ack = read_envelope(&mut peer, &mut decoder).await;
            assert_eq!(ack.message, RadioMessage::Ack { ack_id: 7 });
        }

        assert_eq!(inbound.recv().await.unwrap(), sync_request_envelope(7));
        assert!(inbound.try_recv().is_err(), "duplicate was dispatched");

        engine.stop().await;
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_inbound_without_need_ack_is_not_acked() {
        let (engine, mut peer, mut inbound) = engine(test_config());
        engine.start().await.unwrap();

        peer.write_all(&frame_of(&Envelope {
            header: PacketHeader { packet_id: 3, need_ack: false, timestamp_us: 5 },
            message: gps_message(),
        })).await.unwrap();

        assert_eq!(inbound.recv().await.unwrap().header.packet_id, 3);

        // nothing must come back for a fire-and-forget message
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
        assert!(read.is_err(), "unexpected bytes from the engine");

        engine.stop().await;
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_stop_cancels_pending_sends() {
        let mut config = test_config();
        config.ack_timeout = Duration::from_secs(60);
        let (engine, _peer, _inbound) = engine(config);
        engine.start().await.unwrap();

        let engine = Arc::new(engine);
        let sender = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.send(gps_message(), true).await })
        };

        // let the send register before stopping
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.stop().await;

        let result = sender.await.unwrap();
        assert!(matches!(result, Err(SendError::Cancelled)));
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_pending_send_survives_reconnect() {
        let mut config = test_config();
        config.ack_timeout = Duration::from_millis(200);

        let (ours, mut peer) = tokio::io::duplex(64 * 1024);
        let (replacement_tx, replacement_rx) = mpsc::unbounded_channel();
        let (tx, _inbound) = mpsc::unbounded_channel();
        let engine = Arc::new(ReliableLink::new(
            Box::new(DuplexLink { io: Some(ours), replacements: Some(replacement_rx) }),
            Arc::new(RecordingHandler { tx }),
            config,
        ));
        engine.start().await.unwrap();

        let send_task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.send(gps_message(), true).await })
        };

        // the first peer sees the initial transmission and goes away without acking
        let mut decoder = FrameDecoder::new(8 * 1024);
        let first = read_envelope(&mut peer, &mut decoder).await;
        drop(peer);

        // hand the engine a fresh pipe to reconnect through
        let (ours, mut peer) = tokio::io::duplex(64 * 1024);
        replacement_tx.send(ours).unwrap();

        // the retransmission arrives on the new pipe and its ack resolves the send
        let mut decoder = FrameDecoder::new(8 * 1024);
        let second = read_envelope(&mut peer, &mut decoder).await;
        assert_eq!(second, first);
        peer.write_all(&ack_frame(second.header.packet_id)).await.unwrap();

        assert!(send_task.await.unwrap().is_ok());
        assert_eq!(engine.state(), SessionState::Open);
        engine.stop().await;
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_stop_during_blocked_server_start_leaves_session_closed() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (tx, _inbound) = mpsc::unbounded_channel();
        let link = TcpLink::new("127.0.0.1".to_string(), port, TcpMode::Server, Duration::from_secs(5));
        let engine = Arc::new(ReliableLink::new(
            Box::new(link),
            Arc::new(RecordingHandler { tx }),
            test_config(),
        ));

        // a server-mode open blocks in accept() until a peer shows up
        let starter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.state(), SessionState::Opening);

        engine.stop().await;
        assert!(starter.await.unwrap().is_err());
        assert_eq!(engine.state(), SessionState::Closed);

        // a peer connecting late must not resurrect the session
        let _late_peer = TcpStream::connect(("127.0.0.1", port)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.state(), SessionState::Closed);
        assert!(engine.tasks.lock().await.is_empty());
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_terminal() {
        let (engine, _peer, _inbound) = engine(test_config());

        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.state(), SessionState::Open);

        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.state(), SessionState::Closed);

        assert!(engine.start().await.is_err());
        assert!(matches!(engine.send(gps_message(), false).await, Err(SendError::Cancelled)));
    }

    #[rstest]
    #[timeout(Duration::from_secs(10))]
    #[tokio::test]
    async fn test_oversize_message_rejected_before_transmission() {
        let mut config = test_config();
        config.max_payload = 16;
        let (engine, _peer, _inbound) = engine(config);
        engine.start().await.unwrap();

        let result = engine.send(gps_message(), false).await;
        assert!(matches!(result, Err(SendError::Encode(_))));

        engine.stop().await;
    }
}
