//! cosync Protocol - what replicas say to each other
//!
//! ## Wire envelope
//! ```text
//! Update      { payload }                 # yrs v1 update
//! StateVector { payload }                 # yrs state vector, asks for a diff
//! Awareness   { client_id, clock, state } # presence, state = None on leave
//! ```
//!
//! Frames are MessagePack. Patches cross language boundaries as RFC 6902
//! operations with JSON Pointer paths.

pub mod awareness;
pub mod error;
pub mod message;
pub mod pointer;

pub use awareness::{
    AwarenessPayload, CursorChat, Focus, Geo, Marquee, MultiplayerCursor, Palette, Profile,
    Transform, IDENTITY_TRANSFORM,
};
pub use error::{ProtocolError, ProtocolResult};
pub use message::SyncMessage;
pub use pointer::{parse_pointer, to_json_patch_operations, to_pointer, JsonPatchOperation};
