//! Shard header parsing and page directory
//!
//! The header region of every shard file starts with a little-endian
//! `u64` length followed by that many bytes of JSON, padded out to
//! `header_size`. Every shard carries the directory for the whole
//! dataset, so building the header from any one shard file is enough to
//! resolve all shard addresses, schemas, and page locations.

use super::page::{Page, PageId};
use super::schema::{FieldType, Schema};
use super::MAX_HEADER_JSON;
use crate::{MindRecordError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct RawHeader {
    header_size: u64,
    page_size: u64,
    shard_count: usize,
    shard_addresses: Vec<String>,
    schemas: Vec<Schema>,
    #[serde(default)]
    index_fields: Vec<(u64, String)>,
    pages: Vec<Vec<Page>>,
}

/// Parsed shard header: sizes, shard addresses, schemas, indexed fields,
/// and the per-shard page directory. Immutable once built.
#[derive(Debug)]
pub struct ShardHeader {
    header_size: u64,
    page_size: u64,
    shard_addresses: Vec<PathBuf>,
    schemas: Vec<Schema>,
    index_fields: Vec<(u64, String)>,
    pages: Vec<Vec<Page>>,
}

impl ShardHeader {
    /// Parse the header region of `path` and resolve the sibling shard
    /// addresses against its parent directory.
    pub fn build(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let json_len = file.read_u64::<LittleEndian>()?;
        if json_len == 0 || json_len > MAX_HEADER_JSON {
            return Err(MindRecordError::FormatMismatch(format!(
                "unreasonable header length {} in {}",
                json_len,
                path.display()
            )));
        }
        let mut raw = vec![0u8; json_len as usize];
        file.read_exact(&mut raw)?;
        let header: RawHeader = serde_json::from_slice(&raw).map_err(|e| {
            MindRecordError::FormatMismatch(format!(
                "invalid header JSON in {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_raw(header, path)
    }

    fn from_raw(raw: RawHeader, path: &Path) -> Result<Self> {
        if raw.page_size == 0 {
            return Err(MindRecordError::FormatMismatch(
                "header declares zero page size".to_string(),
            ));
        }
        if raw.shard_count != raw.shard_addresses.len() || raw.shard_count != raw.pages.len() {
            return Err(MindRecordError::FormatMismatch(format!(
                "header declares {} shards but lists {} addresses and {} page directories",
                raw.shard_count,
                raw.shard_addresses.len(),
                raw.pages.len()
            )));
        }
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let shard_addresses = raw
            .shard_addresses
            .iter()
            .map(|name| base.join(name))
            .collect();
        Ok(Self {
            header_size: raw.header_size,
            page_size: raw.page_size,
            shard_addresses,
            schemas: raw.schemas,
            index_fields: raw.index_fields,
            pages: raw.pages,
        })
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn shard_count(&self) -> usize {
        self.shard_addresses.len()
    }

    /// Absolute paths of all shard files in the dataset.
    pub fn shard_addresses(&self) -> &[PathBuf] {
        &self.shard_addresses
    }

    pub fn schemas(&self) -> &[Schema] {
        &self.schemas
    }

    /// `(schema_id, field_name)` pairs projected into the index databases.
    pub fn index_fields(&self) -> &[(u64, String)] {
        &self.index_fields
    }

    /// Blob field names of the dataset schema.
    pub fn blob_fields(&self) -> Vec<String> {
        self.schemas
            .first()
            .map(|s| s.blob_fields.clone())
            .unwrap_or_default()
    }

    /// Whether any schema declares `column`.
    pub fn has_column(&self, column: &str) -> bool {
        self.schemas.iter().any(|s| s.contains(column))
    }

    /// Declared type of `column` in the first schema that carries it.
    pub fn field_type(&self, column: &str) -> Option<FieldType> {
        self.schemas.iter().find_map(|s| s.field_type(column))
    }

    /// Largest page id of `shard_id`, or `None` for an empty shard.
    pub fn last_page_id(&self, shard_id: usize) -> Option<PageId> {
        self.pages
            .get(shard_id)
            .and_then(|pages| pages.iter().map(|p| p.page_id).max())
    }

    pub fn page(&self, shard_id: usize, page_id: PageId) -> Result<&Page> {
        self.pages
            .get(shard_id)
            .and_then(|pages| pages.iter().find(|p| p.page_id == page_id))
            .ok_or_else(|| {
                MindRecordError::FormatMismatch(format!(
                    "no page {} in shard {}",
                    page_id, shard_id
                ))
            })
    }

    /// Resolve the BLOB page of `shard_id` whose row group id is
    /// `group_id`.
    pub fn page_by_group(&self, group_id: u64, shard_id: usize) -> Result<&Page> {
        self.pages
            .get(shard_id)
            .and_then(|pages| {
                pages
                    .iter()
                    .find(|p| p.is_blob() && p.page_type_id == group_id)
            })
            .ok_or_else(|| {
                MindRecordError::FormatMismatch(format!(
                    "no blob page for row group {} in shard {}",
                    group_id, shard_id
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use serde_json::json;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_header_file(dir: &Path, name: &str, body: &serde_json::Value) -> PathBuf {
        let path = dir.join(name);
        let raw = serde_json::to_vec(body).unwrap();
        let mut file = File::create(&path).unwrap();
        file.write_u64::<LittleEndian>(raw.len() as u64).unwrap();
        file.write_all(&raw).unwrap();
        path
    }

    fn sample_header() -> serde_json::Value {
        json!({
            "header_size": 4096,
            "page_size": 32768,
            "shard_count": 1,
            "shard_addresses": ["demo-0000.mr"],
            "schemas": [{
                "id": 0,
                "fields": {"label": "int64", "data": "bytes"},
                "blob_fields": ["data"]
            }],
            "index_fields": [[0, "label"]],
            "pages": [[
                {"page_id": 0, "page_type": "blob", "page_type_id": 0,
                 "start_row_id": 0, "end_row_id": 3, "page_size": 60},
                {"page_id": 1, "page_type": "raw", "page_type_id": 0,
                 "start_row_id": 0, "end_row_id": 3, "page_size": 90}
            ]]
        })
    }

    #[test]
    fn test_build_and_lookup() {
        let dir = tempdir().unwrap();
        let path = write_header_file(dir.path(), "demo-0000.mr", &sample_header());

        let header = ShardHeader::build(&path).unwrap();
        assert_eq!(header.shard_count(), 1);
        assert_eq!(header.page_size(), 32768);
        assert_eq!(header.header_size(), 4096);
        assert_eq!(header.shard_addresses()[0], dir.path().join("demo-0000.mr"));
        assert_eq!(header.blob_fields(), vec!["data".to_string()]);
        assert_eq!(header.field_type("label"), Some(FieldType::Int64));
        assert!(header.has_column("data"));
        assert!(!header.has_column("missing"));
        assert_eq!(header.last_page_id(0), Some(1));

        let page = header.page_by_group(0, 0).unwrap();
        assert_eq!(page.page_id, 0);
        assert_eq!(page.row_count(), Some(3));
        assert!(header.page_by_group(7, 0).is_err());
        assert!(header.page(0, 9).is_err());
    }

    #[test]
    fn test_inconsistent_shard_count() {
        let dir = tempdir().unwrap();
        let mut body = sample_header();
        body["shard_count"] = json!(2);
        let path = write_header_file(dir.path(), "bad.mr", &body);

        let err = ShardHeader::build(&path).unwrap_err();
        assert!(matches!(err, MindRecordError::FormatMismatch(_)));
    }

    #[test]
    fn test_garbage_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.mr");
        let mut file = File::create(&path).unwrap();
        file.write_u64::<LittleEndian>(5).unwrap();
        file.write_all(b"junk!").unwrap();

        let err = ShardHeader::build(&path).unwrap_err();
        assert!(matches!(err, MindRecordError::FormatMismatch(_)));
    }

    #[test]
    fn test_oversized_length_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.mr");
        let mut file = File::create(&path).unwrap();
        file.write_u64::<LittleEndian>(u64::MAX).unwrap();

        let err = ShardHeader::build(&path).unwrap_err();
        assert!(matches!(err, MindRecordError::FormatMismatch(_)));
    }
}
