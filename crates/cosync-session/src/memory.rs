//! In-memory collaborators
//!
//! Volatile implementations of the host interfaces, suitable for tests, the
//! demo and the simulator. State is lost when the process exits.

use crate::error::{Result, SyncError};
use crate::host::{
    DocumentChange, DocumentHost, Listener, ListenerSet, PresenceChannel, PresenceEvent,
    PresenceSource, Subscription,
};
use cosync_core::{apply_patches, Patch};
use cosync_protocol::{CursorChat, Focus, Geo, SyncMessage, Transform};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Host document store holding one JSON value
pub struct MemoryHost {
    state: Mutex<Value>,
    locked: AtomicBool,
    listeners: ListenerSet<DocumentChange>,
}

impl MemoryHost {
    pub fn new(initial: Value) -> Self {
        Self {
            state: Mutex::new(initial),
            locked: AtomicBool::new(false),
            listeners: ListenerSet::new(),
        }
    }

    /// Apply a local edit and notify subscribers
    pub fn update(&self, patches: Vec<Patch>) -> Result<()> {
        self.commit(patches)
    }

    /// Suspend or resume outbound sync
    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::Release);
    }

    fn commit(&self, patches: Vec<Patch>) -> Result<()> {
        if patches.is_empty() {
            return Ok(());
        }

        let change = {
            let mut state = self.state.lock();
            let next = apply_patches(&state, &patches)
                .map_err(|e| SyncError::Host(e.to_string()))?;
            let prev = std::mem::replace(&mut *state, next.clone());
            DocumentChange {
                next,
                prev,
                patches,
            }
        };

        trace!(patches = change.patches.len(), "Host state changed");
        self.listeners.emit(&change);
        Ok(())
    }
}

impl DocumentHost for MemoryHost {
    fn state(&self) -> Value {
        self.state.lock().clone()
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn apply_patches(&self, patches: &[Patch]) -> Result<()> {
        self.commit(patches.to_vec())
    }

    fn subscribe(&self, listener: Listener<DocumentChange>) -> Subscription {
        self.listeners.add(listener)
    }
}

/// Host pointer, selection and chat state
pub struct MemoryPresence {
    geo: Mutex<Geo>,
    focus: Mutex<Focus>,
    cursor_chat: Mutex<Option<CursorChat>>,
    geo_listeners: ListenerSet<Geo>,
    focus_listeners: ListenerSet<Focus>,
    chat_listeners: ListenerSet<Option<CursorChat>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self {
            geo: Mutex::new(Geo::default()),
            focus: Mutex::new(Focus::default()),
            cursor_chat: Mutex::new(None),
            geo_listeners: ListenerSet::new(),
            focus_listeners: ListenerSet::new(),
            chat_listeners: ListenerSet::new(),
        }
    }

    pub fn set_geo(&self, geo: Geo) {
        *self.geo.lock() = geo.clone();
        self.geo_listeners.emit(&geo);
    }

    pub fn set_pointer(&self, position: [f64; 2]) {
        let geo = Geo {
            position,
            ..self.geo()
        };
        self.set_geo(geo);
    }

    pub fn set_transform(&self, transform: Transform) {
        let geo = Geo {
            transform,
            ..self.geo()
        };
        self.set_geo(geo);
    }

    /// Start (`Some`) or end (`None`) a marquee drag
    pub fn set_marquee_anchor(&self, anchor: Option<[f64; 2]>) {
        let geo = Geo {
            marquee_a: anchor,
            ..self.geo()
        };
        self.set_geo(geo);
    }

    pub fn set_focus(&self, scene_id: Option<String>, selection: Vec<String>) {
        let focus = Focus {
            scene_id,
            selection,
        };
        *self.focus.lock() = focus.clone();
        self.focus_listeners.emit(&focus);
    }

    /// Set the chat bubble; an empty message closes it
    pub fn set_chat_message(&self, txt: &str) {
        let chat = if txt.is_empty() {
            None
        } else {
            Some(CursorChat {
                txt: txt.to_string(),
                ts: now_ms(),
            })
        };
        *self.cursor_chat.lock() = chat.clone();
        self.chat_listeners.emit(&chat);
    }
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceSource for MemoryPresence {
    fn geo(&self) -> Geo {
        self.geo.lock().clone()
    }

    fn focus(&self) -> Focus {
        self.focus.lock().clone()
    }

    fn cursor_chat(&self) -> Option<CursorChat> {
        self.cursor_chat.lock().clone()
    }

    fn subscribe_geo(&self, listener: Listener<Geo>) -> Subscription {
        self.geo_listeners.add(listener)
    }

    fn subscribe_focus(&self, listener: Listener<Focus>) -> Subscription {
        self.focus_listeners.add(listener)
    }

    fn subscribe_cursor_chat(&self, listener: Listener<Option<CursorChat>>) -> Subscription {
        self.chat_listeners.add(listener)
    }
}

/// Presence channel of one peer.
///
/// Keeps every known entry with its clock. Local writes are also handed to
/// outbound listeners as `SyncMessage::Awareness` frames for a transport to
/// relay; remote frames come back in through [`handle_message`](Self::handle_message).
pub struct MemoryAwareness {
    client_id: u64,
    states: DashMap<u64, Value>,
    clocks: DashMap<u64, u32>,
    clock: AtomicU32,
    listeners: ListenerSet<PresenceEvent>,
    outbound: ListenerSet<SyncMessage>,
}

impl MemoryAwareness {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            states: DashMap::new(),
            clocks: DashMap::new(),
            clock: AtomicU32::new(0),
            listeners: ListenerSet::new(),
            outbound: ListenerSet::new(),
        }
    }

    pub fn local_state(&self) -> Option<Value> {
        self.states.get(&self.client_id).map(|entry| entry.value().clone())
    }

    /// Listen for frames that should go to other peers
    pub fn on_outbound(&self, listener: Listener<SyncMessage>) -> Subscription {
        self.outbound.add(listener)
    }

    /// Apply an inbound frame; returns whether anything changed
    pub fn handle_message(&self, message: &SyncMessage) -> bool {
        match message {
            SyncMessage::Awareness {
                client_id,
                clock,
                state,
            } => self.apply_remote(*client_id, *clock, state.clone()),
            _ => false,
        }
    }

    fn apply_remote(&self, client_id: u64, clock: u32, state: Option<Value>) -> bool {
        if client_id == self.client_id {
            return false;
        }
        let known = self.clocks.get(&client_id).map(|c| *c.value());
        if matches!(known, Some(known) if clock <= known) {
            trace!(client_id, clock, "Ignoring stale presence entry");
            return false;
        }
        self.clocks.insert(client_id, clock);

        let event = match state {
            Some(state) => {
                self.states.insert(client_id, state);
                PresenceEvent {
                    updated: vec![client_id],
                    removed: Vec::new(),
                }
            }
            None => {
                if self.states.remove(&client_id).is_none() {
                    return false;
                }
                PresenceEvent {
                    updated: Vec::new(),
                    removed: vec![client_id],
                }
            }
        };
        self.listeners.emit(&event);
        true
    }
}

impl PresenceChannel for MemoryAwareness {
    fn client_id(&self) -> u64 {
        self.client_id
    }

    fn set_local_state(&self, state: Option<Value>) {
        let clock = self.clock.fetch_add(1, Ordering::AcqRel) + 1;
        let event = match &state {
            Some(state) => {
                self.states.insert(self.client_id, state.clone());
                PresenceEvent {
                    updated: vec![self.client_id],
                    removed: Vec::new(),
                }
            }
            None => {
                self.states.remove(&self.client_id);
                PresenceEvent {
                    updated: Vec::new(),
                    removed: vec![self.client_id],
                }
            }
        };

        self.listeners.emit(&event);
        self.outbound.emit(&SyncMessage::Awareness {
            client_id: self.client_id,
            clock,
            state,
        });
    }

    fn states(&self) -> Vec<(u64, Value)> {
        self.states
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    fn on_change(&self, listener: Listener<PresenceEvent>) -> Subscription {
        self.listeners.add(listener)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
