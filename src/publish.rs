//! Fan-out of rendered frames to live viewers.
//!
//! Each subscriber owns a single-slot mailbox. `emit` overwrites whatever the
//! viewer has not read yet, so a slow viewer only ever sees the most recent frame
//! and the capture loop never waits on it.

use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::detect::Detection;
use crate::stats::AggregateStatistics;

/// One published frame.
#[derive(Clone, Debug, Serialize)]
pub struct FramePacket {
    /// JPEG bytes.
    #[serde(skip)]
    pub frame: Vec<u8>,
    pub detections: Vec<Detection>,
    pub stats: Option<AggregateStatistics>,
    pub seq: u64,
    pub annotated: bool,
}

#[derive(Default)]
struct Slot {
    packet: Option<Arc<FramePacket>>,
    closed: bool,
}

#[derive(Default)]
struct Mailbox {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Mailbox {
    fn put(&self, packet: Arc<FramePacket>) -> bool {
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.closed {
            return false;
        }
        slot.packet = Some(packet);
        self.ready.notify_one();
        true
    }

    fn close(&self) {
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.closed = true;
        slot.packet = None;
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.slot.lock().map(|slot| slot.closed).unwrap_or(true)
    }
}

#[derive(Default)]
pub struct Publisher {
    subscribers: Mutex<Vec<Arc<Mailbox>>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let mailbox = Arc::new(Mailbox::default());
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(mailbox.clone()),
            Err(poisoned) => poisoned.into_inner().push(mailbox.clone()),
        }
        Subscription { mailbox }
    }

    /// Deliver to every open subscriber, pruning closed ones. Never blocks on a viewer.
    pub fn emit(&self, packet: FramePacket) {
        let packet = Arc::new(packet);
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|mailbox| mailbox.put(packet.clone()));
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(subs) => subs.iter().filter(|m| !m.is_closed()).count(),
            Err(_) => 0,
        }
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Close every subscription, waking blocked viewers.
    pub fn close_all(&self) {
        let subs = match self.subscribers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for mailbox in subs {
            mailbox.close();
        }
    }
}

/// Receiving side of one viewer. Dropping it unsubscribes.
pub struct Subscription {
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    /// Take the latest packet, waiting up to `timeout`. `None` on timeout or close.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<FramePacket>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.mailbox.slot.lock().ok()?;
        loop {
            if let Some(packet) = slot.packet.take() {
                return Some(packet);
            }
            if slot.closed {
                return None;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            slot = self.mailbox.ready.wait_timeout(slot, remaining).ok()?.0;
        }
    }

    /// Take the latest packet without waiting.
    pub fn try_recv(&self) -> Option<Arc<FramePacket>> {
        self.mailbox.slot.lock().ok()?.packet.take()
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mailbox.close();
    }
}
