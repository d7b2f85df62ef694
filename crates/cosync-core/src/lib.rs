//! cosync Core - Patch Model, CRDT Translation and Patch Binding
//!
//! This crate provides the replica-local half of cosync:
//! - The structural patch vocabulary shared with the host store
//! - Translation between plain JSON values and yrs containers
//! - The patch binder that keeps a shadow snapshot in step with one container

pub mod binder;
pub mod error;
pub mod patch;
pub mod translate;

pub use binder::{BinderOptions, PatchBinder, RemotePatchCallback};
pub use error::{Error, Result};
pub use patch::{apply_patches, diff, Patch, PatchOp, PathKey};
pub use translate::{Container, ContainerKind};
