//! Host collaborator interfaces
//!
//! The session never owns application state. It talks to three
//! collaborators: the host document store, the host presence state (pointer,
//! selection, chat) and the transport's presence channel.

use crate::error::Result;
use crate::throttle::Coalesce;
use cosync_core::Patch;
use cosync_protocol::{CursorChat, Focus, Geo};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback registered with a collaborator
pub type Listener<A> = Arc<dyn Fn(&A)>;

/// Unsubscribe handle; unsubscribes when dropped
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Handle that does nothing on drop
    pub fn detached() -> Self {
        Self { unsubscribe: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

type Slots<A> = Mutex<Vec<(u64, Listener<A>)>>;

/// Registry of listeners for one event type
pub struct ListenerSet<A> {
    next_id: AtomicU64,
    slots: Arc<Slots<A>>,
}

impl<A: 'static> ListenerSet<A> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            slots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add(&self, listener: Listener<A>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push((id, listener));

        let slots: Weak<Slots<A>> = Arc::downgrade(&self.slots);
        Subscription::new(move || {
            if let Some(slots) = slots.upgrade() {
                slots.lock().retain(|(slot, _)| *slot != id);
            }
        })
    }

    /// Call every listener with `event`.
    ///
    /// Listeners run outside the registry lock, so they may subscribe or
    /// unsubscribe while being notified.
    pub fn emit(&self, event: &A) {
        let listeners: Vec<Listener<A>> = self
            .slots
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: 'static> Default for ListenerSet<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// A host document transition
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub next: Value,
    pub prev: Value,
    /// Patches that turn `prev` into `next`, addressed from the host root
    pub patches: Vec<Patch>,
}

impl Coalesce for DocumentChange {
    fn coalesce(mut self, newer: Self) -> Self {
        self.patches.extend(newer.patches);
        Self {
            next: newer.next,
            prev: self.prev,
            patches: self.patches,
        }
    }
}

/// Host document store
pub trait DocumentHost {
    /// Current host state; the synchronized document sits under the
    /// configured document key
    fn state(&self) -> Value;

    /// Whether outbound sync is suspended (e.g. while replaying undo)
    fn is_locked(&self) -> bool;

    /// Apply inbound patches, addressed from the host root
    fn apply_patches(&self, patches: &[Patch]) -> Result<()>;

    fn subscribe(&self, listener: Listener<DocumentChange>) -> Subscription;
}

/// Host pointer, selection and chat state, one subscription per slice
pub trait PresenceSource {
    fn geo(&self) -> Geo;
    fn focus(&self) -> Focus;
    fn cursor_chat(&self) -> Option<CursorChat>;

    fn subscribe_geo(&self, listener: Listener<Geo>) -> Subscription;
    fn subscribe_focus(&self, listener: Listener<Focus>) -> Subscription;
    fn subscribe_cursor_chat(&self, listener: Listener<Option<CursorChat>>) -> Subscription;
}

/// Which presence entries changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceEvent {
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

/// Transport presence channel
pub trait PresenceChannel {
    /// This participant's connection id
    fn client_id(&self) -> u64;

    /// Replace the local entry; `None` clears it
    fn set_local_state(&self, state: Option<Value>);

    /// Every known entry, the local one included
    fn states(&self) -> Vec<(u64, Value)>;

    fn on_change(&self, listener: Listener<PresenceEvent>) -> Subscription;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosync_core::path;
    use serde_json::json;

    #[test]
    fn test_listener_set_unsubscribes_on_drop() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let subscription = set.add(Arc::new(move |n: &u32| sink.lock().push(*n)));
        set.emit(&1);
        drop(subscription);
        set.emit(&2);

        assert_eq!(*seen.lock(), vec![1]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_detached_subscription_keeps_nothing() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let subscription = set.add(Arc::new(|_: &u32| {}));
        assert_eq!(set.len(), 1);
        subscription.unsubscribe();
        assert_eq!(set.len(), 0);

        Subscription::detached().unsubscribe();
    }

    #[test]
    fn test_document_change_coalesce_keeps_full_delta() {
        let first = DocumentChange {
            prev: json!({"v": 0}),
            next: json!({"v": 1}),
            patches: vec![Patch::replace(path!["v"], json!(1))],
        };
        let second = DocumentChange {
            prev: json!({"v": 1}),
            next: json!({"v": 2, "w": 0}),
            patches: vec![
                Patch::replace(path!["v"], json!(2)),
                Patch::add(path!["w"], json!(0)),
            ],
        };

        let merged = first.coalesce(second);
        assert_eq!(merged.prev, json!({"v": 0}));
        assert_eq!(merged.next, json!({"v": 2, "w": 0}));
        assert_eq!(merged.patches.len(), 3);
    }
}
