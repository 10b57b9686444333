//! On-disk dataset fixtures for the reader tests.
//!
//! Writes a complete dataset the way the production writer lays it out:
//! per shard one file with a framed JSON header region, a BLOB page of
//! framed payloads, and a RAW page of framed MessagePack label records,
//! plus the SQLite sidecar with the `SHARD_NAME` and `INDEXES` tables.

use byteorder::{LittleEndian, WriteBytesExt};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const HEADER_SIZE: u64 = 4096;
pub const PAGE_SIZE: u64 = 32768;
const INT64_LEN: u64 = 8;

pub struct Row {
    pub blob: Vec<u8>,
    pub labels: Value,
}

pub fn row(blob: &[u8], labels: Value) -> Row {
    Row {
        blob: blob.to_vec(),
        labels,
    }
}

pub struct DatasetSpec {
    pub name: String,
    /// Label fields as `(name, type)`; the blob field `data` is implied.
    pub fields: Vec<(String, String)>,
    /// Which label fields get `<field>_0` index columns.
    pub indexed: Vec<String>,
    pub shards: Vec<Vec<Row>>,
    /// Record a bogus name in `SHARD_NAME` to provoke the mismatch check.
    pub wrong_shard_name: bool,
}

impl DatasetSpec {
    pub fn new(name: &str, fields: &[(&str, &str)], indexed: &[&str], shards: Vec<Vec<Row>>) -> Self {
        Self {
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(n, t)| (n.to_string(), t.to_string()))
                .collect(),
            indexed: indexed.iter().map(|s| s.to_string()).collect(),
            shards,
            wrong_shard_name: false,
        }
    }

    fn shard_file_name(&self, shard_id: usize) -> String {
        format!("{}-{:04}.mr", self.name, shard_id)
    }

    /// Write every shard file and sidecar database under `dir`; returns
    /// the path of shard 0.
    pub fn write(&self, dir: &Path) -> PathBuf {
        let mut shard_pages = Vec::new();
        let mut shard_bodies = Vec::new();
        let mut shard_index_rows = Vec::new();

        for rows in &self.shards {
            let mut blob_page = Vec::new();
            let mut raw_page = Vec::new();
            let mut index_rows = Vec::new();
            for row in rows {
                let blob_start = blob_page.len() as u64;
                frame(&mut blob_page, &row.blob);
                let blob_end = blob_page.len() as u64;

                let record = rmp_serde::to_vec_named(&row.labels).unwrap();
                let raw_start = raw_page.len() as u64;
                frame(&mut raw_page, &record);
                let raw_end = raw_page.len() as u64;

                index_rows.push((blob_start, blob_end, raw_start, raw_end, row.labels.clone()));
            }
            assert!(blob_page.len() as u64 <= PAGE_SIZE);
            assert!(raw_page.len() as u64 <= PAGE_SIZE);

            shard_pages.push(json!([
                {
                    "page_id": 0, "page_type": "blob", "page_type_id": 0,
                    "start_row_id": 0, "end_row_id": rows.len(),
                    "page_size": blob_page.len()
                },
                {
                    "page_id": 1, "page_type": "raw", "page_type_id": 0,
                    "start_row_id": 0, "end_row_id": rows.len(),
                    "page_size": raw_page.len()
                }
            ]));
            shard_bodies.push((blob_page, raw_page));
            shard_index_rows.push(index_rows);
        }

        let header = self.header_json(&shard_pages);
        let header_bytes = serde_json::to_vec(&header).unwrap();
        assert!((header_bytes.len() as u64) < HEADER_SIZE - INT64_LEN);

        for (shard_id, (blob_page, raw_page)) in shard_bodies.iter().enumerate() {
            let path = dir.join(self.shard_file_name(shard_id));
            let mut file = File::create(&path).unwrap();
            file.write_u64::<LittleEndian>(header_bytes.len() as u64)
                .unwrap();
            file.write_all(&header_bytes).unwrap();
            pad_to(&mut file, HEADER_SIZE);
            file.write_all(blob_page).unwrap();
            pad_to(&mut file, HEADER_SIZE + PAGE_SIZE);
            file.write_all(raw_page).unwrap();
            pad_to(&mut file, HEADER_SIZE + 2 * PAGE_SIZE);

            self.write_sidecar(&path, shard_id, &shard_index_rows[shard_id]);
        }

        dir.join(self.shard_file_name(0))
    }

    fn header_json(&self, shard_pages: &[Value]) -> Value {
        let mut fields = Map::new();
        for (name, field_type) in &self.fields {
            fields.insert(name.clone(), Value::from(field_type.clone()));
        }
        fields.insert("data".to_string(), Value::from("bytes"));
        let index_fields: Vec<Value> = self
            .indexed
            .iter()
            .map(|f| json!([0, f]))
            .collect();
        let addresses: Vec<String> = (0..self.shards.len())
            .map(|i| self.shard_file_name(i))
            .collect();
        json!({
            "header_size": HEADER_SIZE,
            "page_size": PAGE_SIZE,
            "shard_count": self.shards.len(),
            "shard_addresses": addresses,
            "schemas": [{
                "id": 0,
                "fields": fields,
                "blob_fields": ["data"]
            }],
            "index_fields": index_fields,
            "pages": shard_pages,
        })
    }

    fn write_sidecar(
        &self,
        shard_path: &Path,
        shard_id: usize,
        rows: &[(u64, u64, u64, u64, Value)],
    ) {
        let db_path = format!("{}.db", shard_path.display());
        let conn = Connection::open(db_path).unwrap();

        let mut indexed_columns = String::new();
        for field in &self.indexed {
            let field_type = self
                .fields
                .iter()
                .find(|(n, _)| n == field)
                .map(|(_, t)| t.as_str())
                .expect("indexed field must be declared");
            let sql_type = match field_type {
                "int32" | "int64" => "INTEGER",
                "float32" | "float64" => "REAL",
                _ => "TEXT",
            };
            indexed_columns.push_str(&format!(", {}_0 {}", field, sql_type));
        }
        conn.execute_batch(&format!(
            "CREATE TABLE SHARD_NAME (NAME TEXT);
             CREATE TABLE INDEXES (
                 ROW_ID INTEGER, ROW_GROUP_ID INTEGER,
                 PAGE_ID_BLOB INTEGER, PAGE_OFFSET_BLOB INTEGER, PAGE_OFFSET_BLOB_END INTEGER,
                 PAGE_ID_RAW INTEGER, PAGE_OFFSET_RAW INTEGER, PAGE_OFFSET_RAW_END INTEGER{}
             );",
            indexed_columns
        ))
        .unwrap();

        let recorded_name = if self.wrong_shard_name {
            "somebody-else.mr".to_string()
        } else {
            self.shard_file_name(shard_id)
        };
        conn.execute("INSERT INTO SHARD_NAME (NAME) VALUES (?1)", [recorded_name])
            .unwrap();

        for (row_id, (blob_start, blob_end, raw_start, raw_end, labels)) in rows.iter().enumerate()
        {
            let mut sql = format!(
                "INSERT INTO INDEXES VALUES ({}, 0, 0, {}, {}, 1, {}, {}",
                row_id, blob_start, blob_end, raw_start, raw_end
            );
            for field in &self.indexed {
                let value = &labels[field];
                match value {
                    Value::Number(n) => sql.push_str(&format!(", {}", n)),
                    Value::String(s) => sql.push_str(&format!(", '{}'", s)),
                    Value::Null => sql.push_str(", NULL"),
                    other => panic!("unsupported indexed label value {:?}", other),
                }
            }
            sql.push(')');
            conn.execute(&sql, []).unwrap();
        }
    }
}

fn frame(page: &mut Vec<u8>, payload: &[u8]) {
    page.write_u64::<LittleEndian>(payload.len() as u64).unwrap();
    page.extend_from_slice(payload);
}

fn pad_to(file: &mut File, len: u64) {
    let pos = file.metadata().unwrap().len();
    assert!(pos <= len);
    file.write_all(&vec![0u8; (len - pos) as usize]).unwrap();
}
