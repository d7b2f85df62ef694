//! Awareness sync manager - broadcasts the local cursor, merges remote ones

use crate::error::Result;
use crate::host::{PresenceChannel, PresenceEvent, PresenceSource, Subscription};
use cosync_protocol::{AwarenessPayload, CursorChat, Focus, Geo, MultiplayerCursor, Profile};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace};

/// Receives the merged remote cursors on every change
pub type CursorSink = Arc<dyn Fn(&BTreeMap<String, MultiplayerCursor>)>;

/// Who the local participant is
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessIdentity {
    pub cursor_id: String,
    pub profile: Profile,
}

/// Merge raw presence entries into one cursor per `cursor_id`.
///
/// Entries that do not parse as a complete payload and the local connection's
/// own entry are skipped. For duplicate cursor ids the strictly newer `ts`
/// wins.
pub fn merge_cursors(
    entries: impl IntoIterator<Item = (u64, Value)>,
    local_client_id: u64,
) -> BTreeMap<String, MultiplayerCursor> {
    let mut cursors: BTreeMap<String, MultiplayerCursor> = BTreeMap::new();

    for (client_id, state) in entries {
        if client_id == local_client_id {
            continue;
        }
        let Some(payload) = AwarenessPayload::from_state(&state) else {
            trace!(client_id, "Skipping incomplete presence entry");
            continue;
        };

        let cursor = MultiplayerCursor::from(&payload);
        match cursors.get(&cursor.id) {
            Some(existing) if existing.t >= cursor.t => {}
            _ => {
                cursors.insert(cursor.id.clone(), cursor);
            }
        }
    }

    cursors
}

#[derive(Debug, Default)]
struct LocalSlices {
    geo: Geo,
    focus: Focus,
    cursor_chat: Option<CursorChat>,
    ts: u64,
}

/// Keeps the local awareness entry current and publishes remote cursors
pub struct AwarenessSyncManager {
    channel: Arc<dyn PresenceChannel>,
    identity: AwarenessIdentity,
    local: Mutex<LocalSlices>,
    cursors: Mutex<BTreeMap<String, MultiplayerCursor>>,
    sink: CursorSink,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl AwarenessSyncManager {
    /// Subscribe to the three presence slices and the channel, then announce
    /// the local participant with whatever the source already holds
    pub fn new(
        channel: Arc<dyn PresenceChannel>,
        source: &dyn PresenceSource,
        identity: AwarenessIdentity,
        sink: CursorSink,
    ) -> Result<Arc<Self>> {
        let local = LocalSlices {
            geo: source.geo(),
            focus: source.focus(),
            cursor_chat: source.cursor_chat(),
            ts: 0,
        };
        let manager = Arc::new(Self {
            channel,
            identity,
            local: Mutex::new(local),
            cursors: Mutex::new(BTreeMap::new()),
            sink,
            subscriptions: Mutex::new(Vec::new()),
        });

        let subscriptions = vec![
            source.subscribe_geo(on_slice(&manager, |m, geo: &Geo| {
                m.update_geo(geo.clone());
            })),
            source.subscribe_focus(on_slice(&manager, |m, focus: &Focus| {
                m.update_focus(focus.clone());
            })),
            source.subscribe_cursor_chat(on_slice(&manager, |m, chat: &Option<CursorChat>| {
                m.update_cursor_chat(chat.clone());
            })),
            manager
                .channel
                .on_change(on_slice(&manager, |m, _: &PresenceEvent| m.refresh())),
        ];
        manager.subscriptions.lock().extend(subscriptions);

        manager.broadcast();
        info!(cursor_id = %manager.identity.cursor_id, "Awareness sync started");
        Ok(manager)
    }

    pub fn identity(&self) -> &AwarenessIdentity {
        &self.identity
    }

    /// Update the pointer/camera slice; returns whether anything changed
    pub fn update_geo(&self, geo: Geo) -> bool {
        {
            let mut local = self.local.lock();
            if local.geo == geo {
                return false;
            }
            local.geo = geo;
        }
        self.broadcast();
        true
    }

    pub fn update_focus(&self, focus: Focus) -> bool {
        {
            let mut local = self.local.lock();
            if local.focus == focus {
                return false;
            }
            local.focus = focus;
        }
        self.broadcast();
        true
    }

    pub fn update_cursor_chat(&self, cursor_chat: Option<CursorChat>) -> bool {
        {
            let mut local = self.local.lock();
            if local.cursor_chat == cursor_chat {
                return false;
            }
            local.cursor_chat = cursor_chat;
        }
        self.broadcast();
        true
    }

    /// The payload currently advertised for the local participant
    pub fn local_payload(&self) -> AwarenessPayload {
        let local = self.local.lock();
        self.payload(&local)
    }

    /// Re-merge the channel's entries and publish them
    pub fn refresh(&self) {
        let cursors = merge_cursors(self.channel.states(), self.channel.client_id());
        *self.cursors.lock() = cursors.clone();
        (self.sink)(&cursors);
    }

    /// Last merged remote cursors
    pub fn cursors(&self) -> BTreeMap<String, MultiplayerCursor> {
        self.cursors.lock().clone()
    }

    /// Drop every subscription and clear the local entry so peers see the
    /// participant leave at once
    pub fn destroy(&self) {
        let subscriptions: Vec<Subscription> = self.subscriptions.lock().drain(..).collect();
        if subscriptions.is_empty() {
            return;
        }
        drop(subscriptions);
        self.cursors.lock().clear();
        self.channel.set_local_state(None);
        info!(cursor_id = %self.identity.cursor_id, "Awareness sync stopped");
    }

    fn broadcast(&self) {
        let payload = {
            let mut local = self.local.lock();
            local.ts = next_ts(local.ts);
            self.payload(&local)
        };
        debug!(cursor_id = %payload.cursor_id, ts = payload.ts, "Broadcasting awareness");
        self.channel.set_local_state(Some(payload.to_state()));
        self.refresh();
    }

    fn payload(&self, local: &LocalSlices) -> AwarenessPayload {
        AwarenessPayload {
            cursor_id: self.identity.cursor_id.clone(),
            profile: self.identity.profile.clone(),
            focus: local.focus.clone(),
            geo: local.geo.clone(),
            cursor_chat: local.cursor_chat.clone(),
            ts: local.ts,
        }
    }
}

impl Drop for AwarenessSyncManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn on_slice<A, F>(manager: &Arc<AwarenessSyncManager>, f: F) -> Arc<dyn Fn(&A)>
where
    A: 'static,
    F: Fn(&AwarenessSyncManager, &A) + 'static,
{
    let weak: Weak<AwarenessSyncManager> = Arc::downgrade(manager);
    Arc::new(move |value: &A| {
        if let Some(manager) = weak.upgrade() {
            f(&manager, value);
        }
    })
}

/// Wall-clock milliseconds, forced strictly past `last`
fn next_ts(last: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    now.max(last + 1)
}
