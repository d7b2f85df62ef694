//! Patch binder - keeps a shadow snapshot and one yrs container in step

use crate::error::{Error, Result};
use crate::patch::{apply_patches, diff, Patch};
use crate::translate::{self, out_to_json, Container};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;
use yrs::types::{Change, EntryChange, Event, Events, PathSegment};
use yrs::{DeepObservable, Doc, Origin, Subscription, Transact, TransactionMut};

/// Receives the patches derived from a remote change batch
pub type RemotePatchCallback = Arc<dyn Fn(&[Patch])>;

/// Construction options for a [`PatchBinder`]
#[derive(Debug, Clone, Default)]
pub struct BinderOptions {
    /// Origin tag for local writes (a fresh v4 uuid when unset)
    pub origin: Option<String>,
    /// Initial shadow snapshot (the container's content when unset)
    pub seed: Option<Value>,
}

/// Two-way bridge between a plain shadow snapshot and a replicated container
pub struct PatchBinder {
    doc: Doc,
    root: Container,
    tag: String,
    origin: Origin,
    shadow: Arc<Mutex<Value>>,
    subscription: Mutex<Option<Subscription>>,
}

impl PatchBinder {
    /// Bind `root` (a container of `doc`) and start observing it
    pub fn new(
        doc: &Doc,
        root: Container,
        options: BinderOptions,
        on_remote: RemotePatchCallback,
    ) -> Self {
        let tag = options
            .origin
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let origin = Origin::from(tag.as_str());

        let initial = match options.seed {
            Some(seed) => seed,
            None => {
                let txn = doc.transact();
                root.to_plain(&txn)
            }
        };
        let shadow = Arc::new(Mutex::new(initial));
        let subscription = observe(&root, origin.clone(), shadow.clone(), on_remote);

        debug!(origin = %tag, kind = %root.kind(), "Patch binder attached");

        Self {
            doc: doc.clone(),
            root,
            tag,
            origin,
            shadow,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    /// Origin tag attached to this binder's transactions
    pub fn origin_tag(&self) -> &str {
        &self.tag
    }

    pub fn container(&self) -> &Container {
        &self.root
    }

    /// Current shadow snapshot
    pub fn snapshot(&self) -> Value {
        self.shadow.lock().clone()
    }

    pub fn is_container_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.root.is_empty(&txn)
    }

    /// Write locally-authored patches to the container in one tagged transaction.
    ///
    /// The whole list is validated against the shadow snapshot before the
    /// transaction opens, so a rejected list leaves both sides untouched.
    pub fn apply_local_patches(&self, patches: &[Patch]) -> Result<()> {
        if patches.is_empty() {
            return Ok(());
        }

        let next = {
            let shadow = self.shadow.lock();
            apply_patches(&shadow, patches)?
        };

        let outcome = {
            let mut txn = self.doc.transact_mut_with(self.origin.clone());
            patches
                .iter()
                .try_for_each(|patch| translate::apply_patch(&mut txn, &self.root, patch))
        };

        match outcome {
            Ok(()) => {
                *self.shadow.lock() = next;
                trace!(origin = %self.tag, patches = patches.len(), "Local patches committed");
                Ok(())
            }
            Err(err) => {
                error!(origin = %self.tag, error = %err, "Container rejected a validated patch list");
                self.resync();
                Err(err)
            }
        }
    }

    /// Re-derive the shadow snapshot from the container
    pub fn resync(&self) {
        let plain = {
            let txn = self.doc.transact();
            self.root.to_plain(&txn)
        };
        *self.shadow.lock() = plain;
    }

    /// Detach the deep observer
    pub fn destroy(&self) {
        if self.subscription.lock().take().is_some() {
            debug!(origin = %self.tag, "Patch binder detached");
        }
    }
}

impl std::fmt::Debug for PatchBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchBinder")
            .field("origin", &self.tag)
            .field("root", &self.root)
            .finish()
    }
}

fn observe(
    root: &Container,
    origin: Origin,
    shadow: Arc<Mutex<Value>>,
    on_remote: RemotePatchCallback,
) -> Subscription {
    let handle = root.clone();
    let handler = move |txn: &TransactionMut, events: &Events| {
        if txn.origin() == Some(&origin) {
            return;
        }

        let patches = {
            let mut shadow = shadow.lock();
            let next = replay(&shadow, txn, events, &handle);
            let patches = diff(&shadow, &next);
            if !patches.is_empty() {
                *shadow = next;
            }
            patches
        };

        if !patches.is_empty() {
            on_remote(&patches);
        }
    };

    match root {
        Container::Map(map) => map.observe_deep(handler),
        Container::Array(array) => array.observe_deep(handler),
    }
}

/// Replay a change batch onto a copy of the shadow snapshot
fn replay(shadow: &Value, txn: &TransactionMut, events: &Events, root: &Container) -> Value {
    // Parents first: event paths describe final positions, so structural
    // changes higher up must land before anything below them.
    let mut ordered: Vec<&Event> = events.iter().collect();
    ordered.sort_by_key(|event| event.path().len());

    let mut draft = shadow.clone();
    for event in ordered {
        if let Err(err) = replay_event(&mut draft, txn, event) {
            warn!(error = %err, "Shadow replay diverged, rebuilding from container");
            return root.to_plain(txn);
        }
    }
    draft
}

fn replay_event(draft: &mut Value, txn: &TransactionMut, event: &Event) -> Result<()> {
    let path = event.path();
    let mut target = draft;
    for segment in path.iter() {
        let next = match segment {
            PathSegment::Key(key) => target.get_mut(key.as_ref()),
            PathSegment::Index(idx) => target.get_mut(*idx as usize),
        };
        target = next.ok_or_else(|| Error::Traversal(format!("event path {:?}", path)))?;
    }

    match event {
        Event::Map(map_event) => {
            let Value::Object(entries) = target else {
                return Err(Error::Traversal("map event on a non-object".into()));
            };
            for (key, change) in map_event.keys(txn) {
                match change {
                    EntryChange::Inserted(value) | EntryChange::Updated(_, value) => {
                        entries.insert(key.to_string(), out_to_json(value, txn));
                    }
                    EntryChange::Removed(_) => {
                        entries.remove(key.as_ref());
                    }
                }
            }
        }
        Event::Array(array_event) => {
            let Value::Array(items) = target else {
                return Err(Error::Traversal("array event on a non-array".into()));
            };
            let mut idx = 0usize;
            for change in array_event.delta(txn) {
                match change {
                    Change::Retain(n) => idx += *n as usize,
                    Change::Added(values) => {
                        if idx > items.len() {
                            return Err(Error::Traversal(format!("insert at {}", idx)));
                        }
                        for value in values {
                            items.insert(idx, out_to_json(value, txn));
                            idx += 1;
                        }
                    }
                    Change::Removed(n) => {
                        let end = idx + *n as usize;
                        if end > items.len() {
                            return Err(Error::Traversal(format!("remove {}..{}", idx, end)));
                        }
                        items.drain(idx..end);
                    }
                }
            }
        }
        _ => return Err(Error::Traversal("unsupported event kind".into())),
    }
    Ok(())
}
