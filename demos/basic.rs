//! Basic cosync Example
//!
//! Two editors share one document. Each edits its own host store and the
//! replicas exchange yrs updates directly.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;

use cosync_core::{path, Patch};
use cosync_protocol::{to_json_patch_operations, SyncMessage};
use cosync_session::{DocumentHost, DocumentSyncManager, MemoryHost, SyncConfig};
use serde_json::json;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, Transact, Update};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("cosync Basic Example\n");

    let config = SyncConfig {
        throttle_ms: 0,
        ..SyncConfig::default()
    };

    let alice_doc = Doc::new();
    let alice = Arc::new(MemoryHost::new(json!({
        "document": {"nodes": {}, "scenes": {"main": {"name": "Main"}}},
        "selection": []
    })));
    let _alice_sync = DocumentSyncManager::new(&alice_doc, alice.clone(), config.clone())?;

    let bob_doc = Doc::new();
    let bob = Arc::new(MemoryHost::new(json!({
        "document": {"nodes": {}, "scenes": {}},
        "selection": []
    })));
    let _bob_sync = DocumentSyncManager::new(&bob_doc, bob.clone(), config)?;

    println!("=== Bob joins ===");
    exchange(&alice_doc, &bob_doc)?;
    println!("Bob: {}\n", bob.state()["document"]);

    println!("=== Concurrent edits ===");
    let rect = vec![Patch::add(
        path!["document", "nodes", "rect-1"],
        json!({"type": "rect", "x": 10, "y": 10}),
    )];
    for op in to_json_patch_operations(&rect) {
        println!("Alice sends {}", serde_json::to_string(&op)?);
    }
    alice.update(rect)?;
    bob.update(vec![
        Patch::add(path!["document", "nodes", "text-1"], json!({"type": "text", "text": "hi"})),
        Patch::replace(path!["selection"], json!(["text-1"])),
    ])?;

    exchange(&alice_doc, &bob_doc)?;
    exchange(&bob_doc, &alice_doc)?;

    println!("Alice: {}", alice.state()["document"]);
    println!("Bob:   {}", bob.state()["document"]);
    println!(
        "Converged: {}",
        alice.state()["document"] == bob.state()["document"]
    );
    // selection is not part of the document, so it stays local
    println!("Bob's selection: {}", bob.state()["selection"]);

    Ok(())
}

/// Send everything `to` is missing from `from`, framed the way peers would
fn exchange(from: &Doc, to: &Doc) -> Result<(), Box<dyn std::error::Error>> {
    let sv = to.transact().state_vector();
    let frame = SyncMessage::update(from.transact().encode_state_as_update_v1(&sv)).encode()?;

    if let SyncMessage::Update { payload } = SyncMessage::decode(&frame)? {
        let update = Update::decode_v1(&payload)?;
        let mut txn = to.transact_mut();
        txn.apply_update(update)
            .map_err(|e| format!("failed to apply update: {}", e))?;
    }
    Ok(())
}
