//! Document sync manager - routes host patches to partition binders and back

use crate::config::{PartitionConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::guard::ReentrancyGuard;
use crate::host::{DocumentChange, DocumentHost, Subscription};
use crate::throttle::Throttle;
use cosync_core::{
    BinderOptions, Container, ContainerKind, Error as CoreError, Patch, PatchBinder, PathKey,
    RemotePatchCallback,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};
use uuid::Uuid;
use yrs::Doc;

/// Split document-level patches by partition.
///
/// Each patch under `document_key` is routed by its second path segment and
/// re-addressed relative to the partition root. Patches outside the document
/// or outside known partitions are dropped. Replacing the document itself
/// is rejected.
pub fn group_patches(
    patches: &[Patch],
    document_key: &str,
    partitions: &[&str],
) -> Result<BTreeMap<String, Vec<Patch>>> {
    let mut groups: BTreeMap<String, Vec<Patch>> = BTreeMap::new();

    for patch in patches {
        match patch.path.first() {
            Some(PathKey::Key(key)) if key == document_key => {}
            _ => {
                trace!(op = %patch.op, "Dropping patch outside the document");
                continue;
            }
        }

        match patch.path.get(1) {
            None => return Err(CoreError::FullReplacementUnsupported.into()),
            Some(PathKey::Key(partition)) if partitions.contains(&partition.as_str()) => {
                groups
                    .entry(partition.clone())
                    .or_default()
                    .push(patch.strip_prefix(2));
            }
            Some(other) => {
                debug!(partition = %other, "Dropping patch outside known partitions");
            }
        }
    }

    Ok(groups)
}

struct Partition {
    key: String,
    binder: PatchBinder,
}

/// Keeps one host document in step with one replicated `Doc`
pub struct DocumentSyncManager {
    config: SyncConfig,
    origin: String,
    host: Arc<dyn DocumentHost>,
    partitions: Vec<Partition>,
    guard: ReentrancyGuard,
    throttle: Mutex<Throttle<DocumentChange>>,
    subscription: Mutex<Option<Subscription>>,
    /// Woken whenever a change is left pending or the manager stops
    wakeup: Arc<Notify>,
    stopped: AtomicBool,
}

impl DocumentSyncManager {
    /// Bind every configured partition, reconcile it with the host and start
    /// listening to host changes
    pub fn new(doc: &Doc, host: Arc<dyn DocumentHost>, config: SyncConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let origin = config
            .origin
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let guard = ReentrancyGuard::new();
        let document = host
            .state()
            .get(&config.document_key)
            .cloned()
            .unwrap_or(Value::Null);

        let mut partitions = Vec::with_capacity(config.partitions.len());
        for partition in &config.partitions {
            let local = local_seed(&document, partition)?;
            let root = match partition.kind {
                ContainerKind::Map => Container::Map(doc.get_or_insert_map(partition.key.as_str())),
                ContainerKind::Array => {
                    Container::Array(doc.get_or_insert_array(partition.key.as_str()))
                }
            };
            let binder = PatchBinder::new(
                doc,
                root,
                BinderOptions {
                    origin: Some(origin.clone()),
                    seed: Some(local.clone()),
                },
                remote_callback(
                    host.clone(),
                    guard.clone(),
                    &config.document_key,
                    &partition.key,
                ),
            );

            reconcile(&host, &guard, &config.document_key, &partition.key, &binder, local)?;
            partitions.push(Partition {
                key: partition.key.clone(),
                binder,
            });
        }

        let manager = Arc::new(Self {
            throttle: Mutex::new(Throttle::new(config.throttle_window())),
            config,
            origin,
            host,
            partitions,
            guard,
            subscription: Mutex::new(None),
            wakeup: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&manager);
        let subscription = manager.host.subscribe(Arc::new(move |change: &DocumentChange| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if let Err(err) = manager.handle_change(change.clone()) {
                error!(error = %err, "Failed to sync local change");
            }
        }));
        *manager.subscription.lock() = Some(subscription);

        info!(
            origin = %manager.origin,
            partitions = manager.partitions.len(),
            "Document sync started"
        );
        Ok(manager)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Shadow snapshot of one partition
    pub fn snapshot(&self, partition: &str) -> Option<Value> {
        self.partition(partition).map(|p| p.binder.snapshot())
    }

    /// Feed one host notification through the throttle
    pub fn handle_change(&self, change: DocumentChange) -> Result<()> {
        self.handle_change_at(change, Instant::now())
    }

    pub fn handle_change_at(&self, change: DocumentChange, now: Instant) -> Result<()> {
        if self.guard.is_held() {
            // raised by our own write into the host
            debug!("Ignoring host change raised during sync");
            return Ok(());
        }

        let released = self.throttle.lock().offer(change, now);
        match released {
            Some(change) => self.push_local(&change),
            None => {
                self.wakeup.notify_one();
                Ok(())
            }
        }
    }

    /// Release a throttled change whose window has elapsed
    pub fn tick(&self, now: Instant) -> Result<()> {
        let released = self.throttle.lock().poll(now);
        match released {
            Some(change) => self.push_local(&change),
            None => Ok(()),
        }
    }

    /// Release a throttled change right away
    pub fn flush(&self) -> Result<()> {
        let released = self.throttle.lock().flush();
        match released {
            Some(change) => self.push_local(&change),
            None => Ok(()),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.throttle.lock().has_pending()
    }

    /// When the pending change becomes releasable, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        self.throttle.lock().deadline()
    }

    /// Release throttled changes on their own once the window elapses.
    ///
    /// Runs until [`destroy`](Self::destroy) or until the manager is
    /// dropped. Host callbacks are not `Send`, so the driver is a local
    /// task and must be spawned inside a `tokio::task::LocalSet`.
    pub fn spawn_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let wakeup = self.wakeup.clone();

        tokio::task::spawn_local(async move {
            loop {
                let deadline = match weak.upgrade() {
                    Some(manager) if !manager.stopped.load(Ordering::Acquire) => {
                        manager.deadline()
                    }
                    _ => break,
                };

                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => wakeup.notified().await,
                }

                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = manager.tick(Instant::now()) {
                    error!(error = %err, "Failed to sync throttled change");
                }
            }
            trace!("Throttle driver stopped");
        })
    }

    /// Flush pending local changes, detach every binder and stop listening
    pub fn destroy(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup.notify_one();
        if let Err(err) = self.flush() {
            error!(error = %err, "Failed to flush pending change on teardown");
        }
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        for partition in &self.partitions {
            partition.binder.destroy();
        }
        info!(origin = %self.origin, "Document sync stopped");
    }

    fn partition(&self, key: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.key == key)
    }

    fn push_local(&self, change: &DocumentChange) -> Result<()> {
        if self.host.is_locked() {
            debug!(patches = change.patches.len(), "Host is locked, skipping local change");
            return Ok(());
        }

        let groups = group_patches(
            &change.patches,
            &self.config.document_key,
            &self.config.partition_keys(),
        )?;

        for (key, patches) in groups {
            let partition = self
                .partition(&key)
                .ok_or_else(|| SyncError::UnknownPartition(key.clone()))?;

            match self
                .guard
                .try_run(|| partition.binder.apply_local_patches(&patches))
            {
                Some(result) => {
                    result?;
                    trace!(partition = %key, patches = patches.len(), "Local patches synced");
                }
                None => debug!(partition = %key, "Sync in progress, skipping local patches"),
            }
        }
        Ok(())
    }
}

impl Drop for DocumentSyncManager {
    fn drop(&mut self) {
        self.wakeup.notify_one();
        for partition in &self.partitions {
            partition.binder.destroy();
        }
    }
}

fn remote_callback(
    host: Arc<dyn DocumentHost>,
    guard: ReentrancyGuard,
    document_key: &str,
    partition: &str,
) -> RemotePatchCallback {
    let prefix = vec![PathKey::from(document_key), PathKey::from(partition)];
    let partition = partition.to_string();

    Arc::new(move |patches: &[Patch]| {
        let prefixed: Vec<Patch> = patches.iter().map(|p| p.prefixed(&prefix)).collect();
        match guard.try_run(|| host.apply_patches(&prefixed)) {
            Some(Ok(())) => {
                trace!(partition = %partition, patches = prefixed.len(), "Remote patches applied")
            }
            Some(Err(err)) => {
                error!(partition = %partition, error = %err, "Host rejected remote patches")
            }
            None => debug!(partition = %partition, "Local write in flight, skipping remote patches"),
        }
    })
}

fn local_seed(document: &Value, partition: &PartitionConfig) -> Result<Value> {
    let value = match document.get(&partition.key) {
        None | Some(Value::Null) => empty_of(partition.kind),
        Some(value) => value.clone(),
    };

    let fits = matches!(
        (partition.kind, &value),
        (ContainerKind::Map, Value::Object(_)) | (ContainerKind::Array, Value::Array(_))
    );
    if !fits {
        return Err(SyncError::Host(format!(
            "partition {} is not a {}",
            partition.key, partition.kind
        )));
    }
    Ok(value)
}

fn empty_of(kind: ContainerKind) -> Value {
    match kind {
        ContainerKind::Map => Value::Object(Map::new()),
        ContainerKind::Array => Value::Array(Vec::new()),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Object(entries) => entries.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => true,
    }
}

/// First writer seeds the shared partition, late joiners adopt it
fn reconcile(
    host: &Arc<dyn DocumentHost>,
    guard: &ReentrancyGuard,
    document_key: &str,
    key: &str,
    binder: &PatchBinder,
    local: Value,
) -> Result<()> {
    if binder.is_container_empty() {
        if !is_empty_value(&local) {
            info!(partition = %key, "Seeding shared partition from local document");
            binder.apply_local_patches(&[Patch::replace(Vec::new(), local)])?;
        }
        return Ok(());
    }

    binder.resync();
    let remote = binder.snapshot();
    if remote == local {
        return Ok(());
    }

    info!(partition = %key, "Adopting shared partition into local document");
    let patch = Patch::replace(vec![PathKey::from(document_key), PathKey::from(key)], remote);
    match guard.try_run(|| host.apply_patches(&[patch])) {
        Some(result) => result,
        None => {
            debug!(partition = %key, "Sync in progress, deferring adoption");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHost;
    use cosync_core::path;
    use serde_json::json;
    use std::time::Duration;
    use yrs::updates::decoder::Decode;
    use yrs::{ReadTxn, Transact, Update};

    fn sync(from: &Doc, to: &Doc) {
        let sv = to.transact().state_vector();
        let update = from.transact().encode_state_as_update_v1(&sv);
        let mut txn = to.transact_mut();
        txn.apply_update(Update::decode_v1(&update).unwrap()).unwrap();
    }

    fn config() -> SyncConfig {
        SyncConfig {
            throttle_ms: 0,
            ..SyncConfig::default()
        }
    }

    fn empty_host() -> Arc<MemoryHost> {
        Arc::new(MemoryHost::new(json!({
            "document": {"nodes": {}, "scenes": {}},
            "selection": []
        })))
    }

    #[test]
    fn test_group_patches_isolates_partitions() {
        let patches = vec![
            Patch::replace(path!["document", "nodes", "node-1", "x"], json!(10)),
            Patch::add(path!["document", "scenes", "scene-1"], json!({"name": "s"})),
            Patch::replace(path!["selection"], json!(["node-1"])),
        ];

        let groups = group_patches(&patches, "document", &["nodes", "scenes"]).unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups["nodes"],
            vec![Patch::replace(path!["node-1", "x"], json!(10))]
        );
        assert_eq!(
            groups["scenes"],
            vec![Patch::add(path!["scene-1"], json!({"name": "s"}))]
        );
    }

    #[test]
    fn test_group_patches_drops_unknown_partitions() {
        let patches = vec![Patch::add(path!["document", "layers", "l1"], json!(1))];
        let groups = group_patches(&patches, "document", &["nodes"]).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_full_document_replace_is_fatal() {
        let patches = vec![Patch::replace(path!["document"], json!({"nodes": {}}))];
        let result = group_patches(&patches, "document", &["nodes", "scenes"]);
        assert!(matches!(
            result,
            Err(SyncError::Core(CoreError::FullReplacementUnsupported))
        ));
    }

    #[test]
    fn test_local_edits_reach_the_container() {
        let doc = Doc::new();
        let host = empty_host();
        let manager = DocumentSyncManager::new(&doc, host.clone(), config()).unwrap();

        host.update(vec![Patch::add(
            path!["document", "nodes", "n1"],
            json!({"id": "n1", "x": 0}),
        )])
        .unwrap();

        assert_eq!(
            manager.snapshot("nodes"),
            Some(json!({"n1": {"id": "n1", "x": 0}}))
        );
        let nodes = Container::Map(doc.get_or_insert_map("nodes"));
        let txn = doc.transact();
        assert_eq!(nodes.to_plain(&txn), json!({"n1": {"id": "n1", "x": 0}}));
    }

    #[test]
    fn test_remote_edits_reach_the_host_without_echo() {
        let doc_a = Doc::new();
        let doc_b = Doc::new();
        let host_a = empty_host();
        let host_b = empty_host();
        let _a = DocumentSyncManager::new(&doc_a, host_a.clone(), config()).unwrap();
        let b = DocumentSyncManager::new(&doc_b, host_b.clone(), config()).unwrap();

        host_a
            .update(vec![Patch::add(path!["document", "nodes", "n1"], json!({"y": 0}))])
            .unwrap();
        sync(&doc_a, &doc_b);

        assert_eq!(host_b.state()["document"]["nodes"], json!({"n1": {"y": 0}}));
        // host_b's notification fired while the guard was held and was dropped
        assert!(!b.has_pending());

        host_b
            .update(vec![Patch::replace(path!["document", "nodes", "n1", "y"], json!(88))])
            .unwrap();
        sync(&doc_b, &doc_a);

        assert_eq!(host_a.state(), host_b.state());
        assert_eq!(host_a.state()["document"]["nodes"]["n1"]["y"], json!(88));
    }

    #[test]
    fn test_locked_host_skips_outbound() {
        let doc = Doc::new();
        let host = empty_host();
        let manager = DocumentSyncManager::new(&doc, host.clone(), config()).unwrap();

        host.set_locked(true);
        host.update(vec![Patch::add(path!["document", "nodes", "n1"], json!(1))])
            .unwrap();

        assert_eq!(manager.snapshot("nodes"), Some(json!({})));
    }

    #[test]
    fn test_throttle_accumulates_patches() {
        let doc = Doc::new();
        let host = empty_host();
        let manager = DocumentSyncManager::new(
            &doc,
            host.clone(),
            SyncConfig {
                throttle_ms: 1_000,
                ..SyncConfig::default()
            },
        )
        .unwrap();

        let start = Instant::now();
        let change = |patches: Vec<Patch>| DocumentChange {
            prev: json!({}),
            next: json!({}),
            patches,
        };

        manager
            .handle_change_at(
                change(vec![Patch::add(path!["document", "nodes", "a"], json!(1))]),
                start,
            )
            .unwrap();
        manager
            .handle_change_at(
                change(vec![Patch::add(path!["document", "nodes", "b"], json!(2))]),
                start + Duration::from_millis(10),
            )
            .unwrap();
        manager
            .handle_change_at(
                change(vec![Patch::add(path!["document", "nodes", "c"], json!(3))]),
                start + Duration::from_millis(20),
            )
            .unwrap();

        assert_eq!(manager.snapshot("nodes"), Some(json!({"a": 1})));
        assert!(manager.has_pending());

        manager.tick(start + Duration::from_millis(500)).unwrap();
        assert!(manager.has_pending());
        manager.tick(start + Duration::from_millis(1_000)).unwrap();

        assert_eq!(manager.snapshot("nodes"), Some(json!({"a": 1, "b": 2, "c": 3})));
    }

    #[tokio::test]
    async fn test_driver_releases_trailing_change_without_tick() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let doc = Doc::new();
                let host = empty_host();
                let manager = DocumentSyncManager::new(
                    &doc,
                    host.clone(),
                    SyncConfig {
                        throttle_ms: 20,
                        ..SyncConfig::default()
                    },
                )
                .unwrap();
                let driver = manager.spawn_driver();

                host.update(vec![Patch::add(path!["document", "nodes", "a"], json!(1))])
                    .unwrap();
                host.update(vec![Patch::add(path!["document", "nodes", "b"], json!(2))])
                    .unwrap();
                assert!(manager.has_pending());
                assert!(manager.deadline().is_some());

                tokio::time::sleep(Duration::from_millis(200)).await;

                assert_eq!(manager.snapshot("nodes"), Some(json!({"a": 1, "b": 2})));
                assert!(!manager.has_pending());
                assert_eq!(manager.deadline(), None);

                manager.destroy();
                driver.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_driver_stops_when_manager_is_dropped() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let doc = Doc::new();
                let manager = DocumentSyncManager::new(&doc, empty_host(), config()).unwrap();
                let driver = manager.spawn_driver();
                tokio::task::yield_now().await;

                drop(manager);
                tokio::time::timeout(Duration::from_secs(1), driver)
                    .await
                    .unwrap()
                    .unwrap();
            })
            .await;
    }

    #[test]
    fn test_remote_batch_is_skipped_while_guard_is_held() {
        let doc_a = Doc::new();
        let doc_b = Doc::new();
        let host_a = empty_host();
        let host_b = empty_host();
        let _a = DocumentSyncManager::new(&doc_a, host_a.clone(), config()).unwrap();
        let b = DocumentSyncManager::new(&doc_b, host_b.clone(), config()).unwrap();

        let notifications = Arc::new(Mutex::new(0usize));
        let counter = notifications.clone();
        let _listener = host_b.subscribe(Arc::new(move |_: &DocumentChange| {
            *counter.lock() += 1;
        }));

        host_a
            .update(vec![Patch::add(path!["document", "nodes", "n1"], json!(1))])
            .unwrap();
        let before = host_b.state();

        // a local write is in flight on b while the remote update lands
        let ran = b.guard.try_run(|| sync(&doc_a, &doc_b));
        assert!(ran.is_some());

        assert_eq!(host_b.state(), before);
        assert_eq!(*notifications.lock(), 0);
        assert!(!b.has_pending());
        // the replica itself still converged
        let nodes = Container::Map(doc_b.get_or_insert_map("nodes"));
        let txn = doc_b.transact();
        assert_eq!(nodes.to_plain(&txn), json!({"n1": 1}));
    }

    #[test]
    fn test_first_writer_seeds_and_late_joiner_adopts() {
        let doc_a = Doc::new();
        let doc_b = Doc::new();
        let host_a = Arc::new(MemoryHost::new(json!({
            "document": {"nodes": {"n1": {"x": 1}}, "scenes": {}}
        })));
        let host_b = Arc::new(MemoryHost::new(json!({
            "document": {"nodes": {"stale": true}}
        })));

        let a = DocumentSyncManager::new(&doc_a, host_a.clone(), config()).unwrap();
        assert_eq!(a.snapshot("nodes"), Some(json!({"n1": {"x": 1}})));

        sync(&doc_a, &doc_b);
        let b = DocumentSyncManager::new(&doc_b, host_b.clone(), config()).unwrap();

        assert_eq!(b.snapshot("nodes"), Some(json!({"n1": {"x": 1}})));
        assert_eq!(host_b.state()["document"]["nodes"], json!({"n1": {"x": 1}}));
    }

    #[test]
    fn test_array_partition() {
        let doc = Doc::new();
        let host = Arc::new(MemoryHost::new(json!({"document": {"pages": ["p1"]}})));
        let manager = DocumentSyncManager::new(
            &doc,
            host.clone(),
            SyncConfig {
                throttle_ms: 0,
                partitions: vec![PartitionConfig::array("pages")],
                ..SyncConfig::default()
            },
        )
        .unwrap();

        host.update(vec![Patch::add(path!["document", "pages", 1usize], json!("p2"))])
            .unwrap();

        assert_eq!(manager.snapshot("pages"), Some(json!(["p1", "p2"])));
        let pages = Container::Array(doc.get_or_insert_array("pages"));
        let txn = doc.transact();
        assert_eq!(pages.to_plain(&txn), json!(["p1", "p2"]));
    }

    #[test]
    fn test_partition_shape_mismatch_is_rejected() {
        let doc = Doc::new();
        let host = Arc::new(MemoryHost::new(json!({"document": {"nodes": [1, 2]}})));
        let result = DocumentSyncManager::new(&doc, host, config());
        assert!(matches!(result, Err(SyncError::Host(_))));
    }

    #[test]
    fn test_destroy_stops_both_directions() {
        let doc_a = Doc::new();
        let doc_b = Doc::new();
        let host_a = empty_host();
        let host_b = empty_host();
        let a = DocumentSyncManager::new(&doc_a, host_a.clone(), config()).unwrap();
        let _b = DocumentSyncManager::new(&doc_b, host_b.clone(), config()).unwrap();

        a.destroy();
        host_a
            .update(vec![Patch::add(path!["document", "nodes", "n1"], json!(1))])
            .unwrap();
        assert_eq!(a.snapshot("nodes"), Some(json!({})));

        host_b
            .update(vec![Patch::add(path!["document", "nodes", "n2"], json!(2))])
            .unwrap();
        sync(&doc_b, &doc_a);
        assert_eq!(host_a.state()["document"]["nodes"], json!({"n1": 1}));
    }
}
