//! Bookkeeping for packet identities: assignment of outgoing ids, tracking of sends that
//!  are awaiting acknowledgement, and the bounded history of recently seen inbound ids
//!  used for duplicate suppression.
//!
//! The registry is owned exclusively by one engine instance and protected by a single
//!  lock there - it is plain single-threaded state.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Resolution of a send that was registered with `need_ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Acked,
    AckTimeout,
    Cancelled,
}

/// One outgoing message awaiting acknowledgement, retransmitted on timeout until the
///  retry budget is exhausted.
struct PendingSend {
    /// the encoded frame, kept verbatim for retransmission
    frame: Bytes,
    deadline: Instant,
    ack_timeout: Duration,
    retries_remaining: u32,
    waiter: oneshot::Sender<SendOutcome>,
}

/// Result of one retry sweep: frames to put back on the wire, and waiters whose retry
///  budget is used up.
#[derive(Default)]
pub struct SweepResult {
    pub retransmit: Vec<Bytes>,
    pub failed: Vec<oneshot::Sender<SendOutcome>>,
}

pub struct PacketRegistry {
    next_id: u32,
    pending: FxHashMap<u32, PendingSend>,
    seen: SeenIds,
}

impl PacketRegistry {
    pub fn new(seen_id_capacity: usize) -> PacketRegistry {
        PacketRegistry {
            next_id: 0,
            pending: FxHashMap::default(),
            seen: SeenIds::new(seen_id_capacity),
        }
    }

    /// Returns a fresh outgoing packet id. The counter wraps at the u32 boundary back to
    ///  zero - there is no reserved sentinel value.
    pub fn next_outgoing_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    pub fn register_pending(
        &mut self,
        id: u32,
        frame: Bytes,
        ack_timeout: Duration,
        max_retries: u32,
        waiter: oneshot::Sender<SendOutcome>,
    ) {
        trace!("tracking packet {} for acknowledgement (timeout {:?}, {} retries)", id, ack_timeout, max_retries);
        self.pending.insert(id, PendingSend {
            frame,
            deadline: Instant::now() + ack_timeout,
            ack_timeout,
            retries_remaining: max_retries,
            waiter,
        });
    }

    /// Resolves the pending send with the given id, if any. A late or duplicate ack is
    ///  not an error - it is silently ignored.
    pub fn on_ack_received(&mut self, ack_id: u32) {
        match self.pending.remove(&ack_id) {
            Some(record) => {
                debug!("packet {} acknowledged", ack_id);
                let _ = record.waiter.send(SendOutcome::Acked);
            }
            None => {
                trace!("ignoring ack for unknown or already resolved packet {}", ack_id);
            }
        }
    }

    /// Checks every pending send against `now`: expired records with retries left are
    ///  re-armed and returned for retransmission, exhausted ones are removed and returned
    ///  as final failures.
    pub fn sweep_expired(&mut self, now: Instant) -> SweepResult {
        let mut result = SweepResult::default();

        let mut exhausted = Vec::new();
        for (&id, record) in self.pending.iter_mut() {
            if record.deadline > now {
                continue;
            }
            if record.retries_remaining > 0 {
                record.retries_remaining -= 1;
                record.deadline = now + record.ack_timeout;
                debug!("no ack for packet {} - retransmitting ({} retries left)", id, record.retries_remaining);
                result.retransmit.push(record.frame.clone());
            } else {
                exhausted.push(id);
            }
        }

        for id in exhausted {
            debug!("packet {} exhausted its retries", id);
            let record = self.pending.remove(&id).expect("id was collected from the map");
            result.failed.push(record.waiter);
        }

        result
    }

    /// Removes a single pending send without resolving it, returning its waiter. Used
    ///  when the send could not be handed to the link in the first place.
    pub fn cancel_pending(&mut self, id: u32) -> Option<oneshot::Sender<SendOutcome>> {
        self.pending.remove(&id).map(|record| record.waiter)
    }

    /// Fails all pending sends, e.g. on session shutdown. The returned waiters are to be
    ///  resolved as cancelled by the caller.
    pub fn drain_pending(&mut self) -> Vec<oneshot::Sender<SendOutcome>> {
        self.pending
            .drain()
            .map(|(_, record)| record.waiter)
            .collect()
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    /// Checks and records an inbound packet id. Returns true if the id was already seen
    ///  within the retention window, i.e. the delivery is a duplicate.
    pub fn is_duplicate(&mut self, id: u32) -> bool {
        self.seen.check_and_record(id)
    }
}

/// Bounded FIFO history of received packet ids. The capacity bound doubles as the aging
///  mechanism: once an id is evicted, a (pathologically) late retransmission would be
///  delivered again - the window just has to comfortably cover the peer's retry horizon.
struct SeenIds {
    set: FxHashSet<u32>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> SeenIds {
        SeenIds {
            set: FxHashSet::default(),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn check_and_record(&mut self, id: u32) -> bool {
        if !self.set.insert(id) {
            return true;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(id);
        false
    }
}
