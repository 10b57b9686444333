//! Record framing and the self-describing record codec
//!
//! Records inside shard pages are framed `[u64 length | payload]`
//! little-endian. RAW-page payloads are self-describing key/value
//! records; the engine never interprets them itself, it goes through a
//! [`RecordCodec`] so the wire encoding stays swappable.

use crate::{MindRecordError, Result};
use serde_json::Value;

/// Size of the record length prefix, in bytes.
pub const INT64_LEN: u64 = 8;

/// Decodes a self-describing record payload into a dynamic value tree.
pub trait RecordCodec: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<Value>;
}

/// Default codec: MessagePack maps with string keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl RecordCodec for MsgpackCodec {
    fn decode(&self, raw: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(raw)
            .map_err(|e| MindRecordError::Decode(format!("msgpack record decode failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_map() {
        let value = json!({"label": 3, "text": "cat"});
        let raw = rmp_serde::to_vec_named(&value).unwrap();
        assert_eq!(MsgpackCodec.decode(&raw).unwrap(), value);
    }

    #[test]
    fn test_decode_garbage() {
        let err = MsgpackCodec.decode(&[0xc1, 0xff, 0x00]).unwrap_err();
        assert!(matches!(err, MindRecordError::Decode(_)));
    }
}
