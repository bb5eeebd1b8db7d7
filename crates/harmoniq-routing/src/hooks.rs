//! Extension points with veto semantics and the subscription event bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::proplist::Proplist;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    /// Continue with the next slot.
    Ok,
    /// Handled; skip the remaining slots.
    Stop,
    /// Veto the operation.
    Cancel,
}

pub type HookCallback<T> = Arc<dyn Fn(&mut T) -> HookResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookSlotId(u64);

struct HookSlot<T> {
    id: HookSlotId,
    priority: i32,
    callback: HookCallback<T>,
}

/// A priority ordered list of callbacks. Lower priorities run first.
pub struct Hook<T> {
    slots: Mutex<Vec<HookSlot<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for Hook<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> Hook<T> {
    pub fn connect<F>(&self, priority: i32, callback: F) -> HookSlotId
    where
        F: Fn(&mut T) -> HookResult + Send + Sync + 'static,
    {
        let id = HookSlotId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slots = self.slots.lock();
        let position = slots
            .iter()
            .position(|slot| slot.priority > priority)
            .unwrap_or(slots.len());
        slots.insert(
            position,
            HookSlot {
                id,
                priority,
                callback: Arc::new(callback),
            },
        );
        id
    }

    pub fn disconnect(&self, id: HookSlotId) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Runs the slots in order. Callbacks run without the slot lock held, so
    /// they may connect or disconnect slots themselves.
    pub fn fire(&self, data: &mut T) -> HookResult {
        let callbacks: Vec<HookCallback<T>> = self
            .slots
            .lock()
            .iter()
            .map(|slot| Arc::clone(&slot.callback))
            .collect();
        for callback in callbacks {
            match callback(data) {
                HookResult::Ok => continue,
                other => return other,
            }
        }
        HookResult::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Facility {
    Sink,
    Source,
    SinkInput,
    SourceOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    New,
    Change,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionEvent {
    pub facility: Facility,
    pub kind: EventKind,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Subscription(SubscriptionEvent),
    /// A driver or realtime failure, reported so policy code can react.
    DriverFailure {
        facility: Facility,
        index: u32,
        message: String,
    },
    /// The default device of a direction changed.
    DefaultChanged {
        facility: Facility,
        index: Option<u32>,
    },
    /// A stream level event such as a lost format during a move.
    StreamEvent {
        facility: Facility,
        index: u32,
        name: String,
        properties: Proplist,
    },
}

/// Fans core events out to every subscriber.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<CoreEvent>>>,
}

impl EventBus {
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: CoreEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn post(&self, facility: Facility, kind: EventKind, index: u32) {
        self.publish(CoreEvent::Subscription(SubscriptionEvent {
            facility,
            kind,
            index,
        }));
    }
}
