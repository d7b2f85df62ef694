//! Replica wire envelope

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// A frame exchanged between replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// v1-encoded document update
    Update { payload: Vec<u8> },

    /// Sender's state vector; the receiver answers with the missing update
    StateVector { payload: Vec<u8> },

    /// Presence entry of one participant, `None` once it leaves
    Awareness {
        client_id: u64,
        clock: u32,
        state: Option<Value>,
    },
}

impl SyncMessage {
    pub fn update(payload: impl Into<Vec<u8>>) -> Self {
        SyncMessage::Update {
            payload: payload.into(),
        }
    }

    pub fn state_vector(payload: impl Into<Vec<u8>>) -> Self {
        SyncMessage::StateVector {
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Update { .. } => "update",
            SyncMessage::StateVector { .. } => "state_vector",
            SyncMessage::Awareness { .. } => "awareness",
        }
    }

    /// Encode as a MessagePack frame
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let frame = rmp_serde::to_vec_named(self)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        trace!(kind = self.kind(), bytes = frame.len(), "Encoded frame");
        Ok(Bytes::from(frame))
    }

    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        rmp_serde::from_slice(frame).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_decode_to_the_same_message() {
        let messages = vec![
            SyncMessage::update(vec![1u8, 2, 3]),
            SyncMessage::state_vector(Vec::<u8>::new()),
            SyncMessage::Awareness {
                client_id: u64::MAX,
                clock: 7,
                state: Some(json!({"cursor_id": "a", "geo": {"position": [1.5, -2.0]}})),
            },
            SyncMessage::Awareness {
                client_id: 3,
                clock: 8,
                state: None,
            },
        ];

        for message in messages {
            let frame = message.encode().unwrap();
            assert_eq!(SyncMessage::decode(&frame).unwrap(), message);
        }
    }

    #[test]
    fn test_garbage_frame_is_a_decode_error() {
        let result = SyncMessage::decode(&[0xc1, 0x00]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
