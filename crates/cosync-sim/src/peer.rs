//! Simulated editor and the in-process network between editors

use anyhow::{anyhow, Result};
use bytes::Bytes;
use cosync_core::{path, Patch};
use cosync_protocol::{MultiplayerCursor, Palette, Profile, SyncMessage};
use cosync_session::{
    AwarenessIdentity, AwarenessSyncManager, DocumentHost, DocumentSyncManager, MemoryAwareness,
    MemoryHost, MemoryPresence, PresenceChannel, Subscription, SyncConfig,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

const PALETTES: [[&str; 11]; 3] = [
    [
        "#eff6ff", "#dbeafe", "#bfdbfe", "#93c5fd", "#60a5fa", "#3b82f6", "#2563eb", "#1d4ed8",
        "#1e40af", "#1e3a8a", "#172554",
    ],
    [
        "#f0fdf4", "#dcfce7", "#bbf7d0", "#86efac", "#4ade80", "#22c55e", "#16a34a", "#15803d",
        "#166534", "#14532d", "#052e16",
    ],
    [
        "#fff1f2", "#ffe4e6", "#fecdd3", "#fda4af", "#fb7185", "#f43f5e", "#e11d48", "#be123c",
        "#9f1239", "#881337", "#4c0519",
    ],
];

/// A frame in flight
#[derive(Debug)]
pub struct Envelope {
    pub from: usize,
    pub frame: Bytes,
}

/// Full mesh of unbounded channels, one inbox per peer
pub struct Mesh {
    inboxes: Vec<mpsc::UnboundedSender<Envelope>>,
}

impl Mesh {
    pub fn new(peers: usize) -> (Arc<Self>, Vec<mpsc::UnboundedReceiver<Envelope>>) {
        let (inboxes, receivers) = (0..peers).map(|_| mpsc::unbounded_channel()).unzip();
        (Arc::new(Self { inboxes }), receivers)
    }

    pub fn send(&self, from: usize, to: usize, frame: Bytes) {
        if let Some(inbox) = self.inboxes.get(to) {
            // a closed inbox means that peer is gone
            let _ = inbox.send(Envelope { from, frame });
        }
    }

    pub fn broadcast(&self, from: usize, frame: Bytes) {
        for to in (0..self.inboxes.len()).filter(|to| *to != from) {
            self.send(from, to, frame.clone());
        }
    }
}

/// One simulated editor: a replica, a host store and both sync managers
pub struct Peer {
    pub index: usize,
    doc: Doc,
    host: Arc<MemoryHost>,
    presence: Arc<MemoryPresence>,
    channel: Arc<MemoryAwareness>,
    sync: Arc<DocumentSyncManager>,
    awareness: Arc<AwarenessSyncManager>,
    mesh: Arc<Mesh>,
    _outbound: Subscription,
}

impl Peer {
    pub fn join(index: usize, initial: Value, config: &SyncConfig, mesh: Arc<Mesh>) -> Result<Self> {
        let doc = Doc::new();
        let host = Arc::new(MemoryHost::new(initial));
        let sync = DocumentSyncManager::new(&doc, host.clone(), config.clone())?;

        let channel = Arc::new(MemoryAwareness::new(doc.client_id()));
        let relay = mesh.clone();
        let outbound = channel.on_outbound(Arc::new(move |message: &SyncMessage| {
            match message.encode() {
                Ok(frame) => relay.broadcast(index, frame),
                Err(err) => error!(peer = index, error = %err, "Failed to encode awareness frame"),
            }
        }));

        let presence = Arc::new(MemoryPresence::new());
        let identity = AwarenessIdentity {
            cursor_id: format!("cursor-{}", index),
            profile: Profile {
                palette: Palette::from_shades(PALETTES[index % PALETTES.len()]),
            },
        };
        let awareness = AwarenessSyncManager::new(
            channel.clone(),
            presence.as_ref(),
            identity,
            Arc::new(move |cursors: &BTreeMap<String, MultiplayerCursor>| {
                trace!(peer = index, cursors = cursors.len(), "Cursors updated");
            }),
        )?;

        debug!(peer = index, client_id = doc.client_id(), "Peer joined");
        Ok(Self {
            index,
            doc,
            host,
            presence,
            channel,
            sync,
            awareness,
            mesh,
            _outbound: outbound,
        })
    }

    /// The synchronized part of the host state
    pub fn document(&self) -> Value {
        self.host
            .state()
            .get(&self.sync.config().document_key)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn sync(&self) -> &DocumentSyncManager {
        &self.sync
    }

    pub fn cursors(&self) -> BTreeMap<String, MultiplayerCursor> {
        self.awareness.cursors()
    }

    /// Presence entries this peer's channel still holds
    pub fn presence_entries(&self) -> usize {
        self.channel.states().len()
    }

    /// Ask every other peer for what this replica is missing
    pub fn announce_state_vector(&self) -> Result<()> {
        let sv = self.doc.transact().state_vector().encode_v1();
        self.mesh
            .broadcast(self.index, SyncMessage::state_vector(sv).encode()?);
        Ok(())
    }

    pub fn handle(&self, envelope: Envelope) -> Result<()> {
        let message = SyncMessage::decode(&envelope.frame)?;
        trace!(peer = self.index, from = envelope.from, kind = message.kind(), "Frame received");

        match message {
            SyncMessage::StateVector { payload } => {
                let sv = StateVector::decode_v1(&payload)
                    .map_err(|e| anyhow!("bad state vector from {}: {}", envelope.from, e))?;
                let update = self.doc.transact().encode_state_as_update_v1(&sv);
                self.mesh
                    .send(self.index, envelope.from, SyncMessage::update(update).encode()?);
            }
            SyncMessage::Update { payload } => {
                let update = Update::decode_v1(&payload)
                    .map_err(|e| anyhow!("bad update from {}: {}", envelope.from, e))?;
                let mut txn = self.doc.transact_mut();
                txn.apply_update(update)
                    .map_err(|e| anyhow!("bad update from {}: {}", envelope.from, e))?;
            }
            message @ SyncMessage::Awareness { .. } => {
                self.channel.handle_message(&message);
            }
        }
        Ok(())
    }

    /// Scripted editing for one step
    pub fn act(&self, step: usize, steps: usize) -> Result<()> {
        let node = format!("node-{}", self.index);

        if step == 0 {
            self.host.update(vec![Patch::add(
                path!["document", "nodes", node.as_str()],
                json!({"id": &node, "x": 0, "y": self.index * 100, "scene_id": "main"}),
            )])?;
        } else {
            self.host.update(vec![Patch::replace(
                path!["document", "nodes", node.as_str(), "x"],
                json!(step * 10),
            )])?;
        }

        let note = |at: usize| format!("note-{}-{}", self.index, at);
        match step % 5 {
            2 => self.host.update(vec![Patch::add(
                path!["document", "nodes", note(step)],
                json!({"id": note(step), "text": format!("step {}", step), "tags": []}),
            )])?,
            3 => self.host.update(vec![Patch::add(
                path!["document", "nodes", note(step - 1), "tags", 0usize],
                json!(format!("peer-{}", self.index)),
            )])?,
            4 => self
                .host
                .update(vec![Patch::remove(path!["document", "nodes", note(step - 2)])])?,
            _ => {}
        }

        // every peer writes the same key in the same step
        if step % 6 == 5 {
            self.host.update(vec![Patch::add(
                path!["document", "scenes", "main", "active_peer"],
                json!(self.index),
            )])?;
        }

        self.presence
            .set_pointer([step as f64 * 3.0, self.index as f64 * 7.0]);
        if step % 4 == 0 {
            self.presence
                .set_focus(Some("main".to_string()), vec![node.clone()]);
        }
        if step == steps / 2 {
            self.presence
                .set_chat_message(&format!("hello from peer {}", self.index));
        } else if step == steps / 2 + 3 {
            self.presence.set_chat_message("");
        }
        Ok(())
    }

    /// Tear down both managers; peers see this cursor disappear
    pub fn leave(&self) {
        self.awareness.destroy();
        self.sync.destroy();
        debug!(peer = self.index, "Peer left");
    }
}
