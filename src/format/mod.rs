//! On-disk shard format
//!
//! A shard file is a fixed-size JSON header region followed by fixed-size
//! pages. BLOB pages hold opaque record payloads, RAW pages hold
//! self-describing label records; both frame every record as
//! `[u64 length | payload]` little-endian. The header region carries the
//! page directory, the schemas, and the list of indexed fields for the
//! whole dataset, so any shard file can bootstrap the reader.

pub mod header;
pub mod page;
pub mod schema;

pub use header::ShardHeader;
pub use page::{Page, PageId, PageType};
pub use schema::{FieldType, Schema};

/// Upper bound on the serialized header JSON, in bytes.
pub const MAX_HEADER_JSON: u64 = 64 * 1024 * 1024;
