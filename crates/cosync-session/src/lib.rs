//! cosync Session
//!
//! Wires the patch binders of `cosync-core` to a host application:
//! - Document sync: partitions host patches, forwards them to binders and
//!   feeds remote patches back into the host store
//! - Awareness sync: broadcasts the local cursor and merges remote ones
//! - Guard and throttle primitives shared by both
//! - In-memory collaborators for tests, demos and the simulator

pub mod awareness;
pub mod config;
pub mod error;
pub mod guard;
pub mod host;
pub mod memory;
pub mod sync;
pub mod throttle;

pub use awareness::{merge_cursors, AwarenessIdentity, AwarenessSyncManager, CursorSink};
pub use config::{PartitionConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use guard::ReentrancyGuard;
pub use host::{
    DocumentChange, DocumentHost, Listener, ListenerSet, PresenceChannel, PresenceEvent,
    PresenceSource, Subscription,
};
pub use memory::{MemoryAwareness, MemoryHost, MemoryPresence};
pub use sync::{group_patches, DocumentSyncManager};
pub use throttle::{Coalesce, Throttle};
