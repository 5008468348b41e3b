use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::session::SessionObserver;
use crate::engine::{FrameDescriptor, PixelFormat};

/// A decoded image owned by the consumer side, copied out of the engine buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub id: String,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: usize,
    /// Per-stream counter, increases with every accepted frame.
    pub sequence: u64,
}

/// Snapshot of the per-stream frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub received: u64,
    /// Frames overwritten before the consumer collected them.
    pub replaced: u64,
    /// Frames dropped because the descriptor did not describe a whole image.
    pub rejected: u64,
}

/// Notifications delivered to the consumer context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    FrameUpdated(String),
    StateChanged { id: String, status: String },
    StreamAdded(String),
    StreamRemoved(String),
    LayoutChanged { rows: u32, cols: u32 },
}

#[derive(Debug)]
struct Envelope {
    /// Slot the event belongs to; `None` for registry-level events.
    token: Option<Uuid>,
    event: ConsumerEvent,
}

#[derive(Debug, Default)]
struct SlotState {
    latest: Option<Arc<DecodedFrame>>,
    uncollected: bool,
    notify_pending: bool,
    sequence: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct SlotCounters {
    received: AtomicU64,
    replaced: AtomicU64,
    rejected: AtomicU64,
}

/// Single-frame mailbox for one stream.
#[derive(Debug)]
struct FrameSlot {
    id: String,
    token: Uuid,
    state: Mutex<SlotState>,
    counters: SlotCounters,
}

type SlotMap = Arc<RwLock<HashMap<String, Arc<FrameSlot>>>>;

/// Hands decoded frames from engine threads to the consumer context,
/// keeping only the newest frame per stream.
#[derive(Debug, Clone)]
pub struct FrameRouter {
    slots: SlotMap,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Receiving half of the router, owned by the consumer context.
#[derive(Debug)]
pub struct ConsumerEvents {
    slots: SlotMap,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl FrameRouter {
    pub fn new() -> (Self, ConsumerEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let slots: SlotMap = Arc::new(RwLock::new(HashMap::new()));

        (
            Self {
                slots: slots.clone(),
                tx,
            },
            ConsumerEvents { slots, rx },
        )
    }

    /// Open a slot for `id` and return the observer a session reports through.
    /// A previous slot under the same id is closed first.
    pub fn bind(&self, id: &str) -> Arc<dyn SessionObserver> {
        let slot = Arc::new(FrameSlot {
            id: id.to_string(),
            token: Uuid::new_v4(),
            state: Mutex::new(SlotState::default()),
            counters: SlotCounters::default(),
        });

        if let Some(previous) = self.slots.write().insert(id.to_string(), slot.clone()) {
            previous.close();
        }
        debug!("Opened frame slot for {}", id);

        Arc::new(SlotBinding {
            slot,
            tx: self.tx.clone(),
        })
    }

    /// Close the slot for `id`. Pending notifications for it are discarded.
    pub fn release(&self, id: &str) {
        if let Some(slot) = self.slots.write().remove(id) {
            slot.close();
            debug!("Released frame slot for {}", id);
        }
    }

    /// Accept a frame produced on an engine thread. Unknown ids are ignored.
    pub fn on_frame_produced(&self, id: &str, frame: &FrameDescriptor<'_>) {
        let Some(slot) = self.slot(id) else {
            trace!("Dropping frame for unknown stream {}", id);
            return;
        };
        slot.store(frame, &self.tx);
    }

    /// Newest frame for `id`; collecting it re-arms the update notification.
    pub fn latest_frame(&self, id: &str) -> Option<Arc<DecodedFrame>> {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock();
        state.notify_pending = false;
        state.uncollected = false;
        state.latest.clone()
    }

    pub fn stats(&self, id: &str) -> Option<FrameStats> {
        self.slot(id).map(|slot| slot.stats())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.read().contains_key(id)
    }

    /// Send an event that is not tied to a frame slot.
    pub fn publish(&self, event: ConsumerEvent) {
        let _ = self.tx.send(Envelope { token: None, event });
    }

    fn slot(&self, id: &str) -> Option<Arc<FrameSlot>> {
        self.slots.read().get(id).cloned()
    }
}

impl FrameSlot {
    fn store(&self, frame: &FrameDescriptor<'_>, tx: &mpsc::UnboundedSender<Envelope>) {
        let Some(data) = copy_image(frame) else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let notify = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }

            state.sequence += 1;
            if state.uncollected {
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
            }
            state.latest = Some(Arc::new(DecodedFrame {
                id: self.id.clone(),
                data,
                width: frame.width,
                height: frame.height,
                format: frame.format,
                stride: frame.stride,
                sequence: state.sequence,
            }));
            state.uncollected = true;
            !std::mem::replace(&mut state.notify_pending, true)
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if notify {
            self.send(tx, ConsumerEvent::FrameUpdated(self.id.clone()));
        }
    }

    fn send(&self, tx: &mpsc::UnboundedSender<Envelope>, event: ConsumerEvent) {
        let _ = tx.send(Envelope {
            token: Some(self.token),
            event,
        });
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.latest = None;
    }

    fn stats(&self) -> FrameStats {
        FrameStats {
            received: self.counters.received.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Copy the visible image out of an engine buffer. `None` when the descriptor
/// does not cover `height` rows of `width` pixels.
fn copy_image(frame: &FrameDescriptor<'_>) -> Option<Vec<u8>> {
    if frame.width == 0 || frame.height == 0 {
        return None;
    }
    let row = (frame.width as usize).checked_mul(frame.format.bytes_per_pixel())?;
    if frame.stride < row {
        return None;
    }
    let needed = frame
        .stride
        .checked_mul(frame.height as usize - 1)?
        .checked_add(row)?;
    if frame.data.len() < needed {
        return None;
    }

    let len = frame
        .stride
        .checked_mul(frame.height as usize)
        .map_or(needed, |full| full.min(frame.data.len()));
    Some(frame.data[..len].to_vec())
}

/// Observer handed to a session; reports straight into its own slot.
struct SlotBinding {
    slot: Arc<FrameSlot>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl SessionObserver for SlotBinding {
    fn on_frame(&self, frame: &FrameDescriptor<'_>) {
        self.slot.store(frame, &self.tx);
    }

    fn on_state_changed(&self, status: &str) {
        if self.slot.state.lock().closed {
            return;
        }
        self.slot.send(
            &self.tx,
            ConsumerEvent::StateChanged {
                id: self.slot.id.clone(),
                status: status.to_string(),
            },
        );
    }
}

impl ConsumerEvents {
    /// Next event for the consumer, skipping events of released slots.
    /// Returns `None` once every router handle is gone.
    pub async fn recv(&mut self) -> Option<ConsumerEvent> {
        loop {
            let envelope = self.rx.recv().await?;
            if self.is_current(&envelope) {
                return Some(envelope.event);
            }
        }
    }

    /// Non-blocking variant of [`ConsumerEvents::recv`].
    pub fn try_recv(&mut self) -> Option<ConsumerEvent> {
        while let Ok(envelope) = self.rx.try_recv() {
            if self.is_current(&envelope) {
                return Some(envelope.event);
            }
        }
        None
    }

    /// Everything queued right now, in order.
    pub fn drain(&mut self) -> Vec<ConsumerEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    fn is_current(&self, envelope: &Envelope) -> bool {
        let Some(token) = envelope.token else {
            return true;
        };
        let id = match &envelope.event {
            ConsumerEvent::FrameUpdated(id) | ConsumerEvent::StateChanged { id, .. } => id,
            _ => return true,
        };
        self.slots
            .read()
            .get(id)
            .is_some_and(|slot| slot.token == token)
    }
}
