//! MindRecord dataset reader
//!
//! A parallel reader for sharded training datasets. Each dataset is a set
//! of shard files (fixed-size pages behind a JSON header) with one SQLite
//! sidecar index database per shard. The reader plans an ordered task
//! list from the index databases, optionally reshapes it with row
//! operators (shuffle, category-balanced sampling), and streams
//! `(blob_bytes, labels)` pairs to a single consumer through a worker
//! pool with bounded, in-order delivery.

pub mod blob;
pub mod codec;
pub mod format;
pub mod index;
pub mod operator;
pub mod reader;
pub mod task;

// Re-export main types
pub use codec::{MsgpackCodec, RecordCodec, INT64_LEN};
pub use format::{FieldType, Page, PageType, Schema, ShardHeader};
pub use operator::Operator;
pub use reader::{
    RowBatch, RowGroupSummary, ShardReader, MAX_CONSUMER_COUNT, MAX_SHARD_COUNT,
    MIN_CONSUMER_COUNT, NUM_BATCH_IN_MAP, NUM_PAGE_IN_BUFFER,
};
pub use task::{Task, TaskAddress, TaskList};

/// Reader error type
#[derive(Debug, thiserror::Error)]
pub enum MindRecordError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index database error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    #[error("illegal column list: {0}")]
    IllegalColumnList(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("reader interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, MindRecordError>;
