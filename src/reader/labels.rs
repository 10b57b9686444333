//! Label resolution
//!
//! Two paths produce the `labels` half of a delivered row. When every
//! selected column is projected into the index databases, labels come
//! straight from SQL with typed casting. Otherwise the index only yields
//! the RAW-page location of each record and the resolver reads and
//! decodes the self-describing record from the shard file.

use crate::blob::BlobFile;
use crate::codec::{RecordCodec, INT64_LEN};
use crate::format::ShardHeader;
use crate::index::IndexDb;
use crate::{MindRecordError, Result};
use ahash::AHashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::thread;

/// Byte ranges and labels of one BLOB page, ready for block delivery.
pub(crate) struct RowGroupBrief {
    /// Bytes in use within the page
    pub page_length: u64,
    /// Absolute file offset of the page
    pub page_offset: u64,
    /// Payload ranges relative to the page start, length prefix skipped
    pub offsets: Vec<(u64, u64)>,
    pub labels: Vec<Value>,
}

/// Location of one logical row as recorded in the index.
pub(crate) struct RowMeta {
    pub group_id: u64,
    pub start: u64,
    pub end: u64,
}

pub(crate) struct LabelResolver {
    header: Arc<ShardHeader>,
    index: Arc<Vec<IndexDb>>,
    codec: Arc<dyn RecordCodec>,
    columns: Vec<String>,
    column_schema_id: AHashMap<String, u64>,
    all_in_index: bool,
}

impl LabelResolver {
    pub fn new(
        header: Arc<ShardHeader>,
        index: Arc<Vec<IndexDb>>,
        codec: Arc<dyn RecordCodec>,
        columns: Vec<String>,
    ) -> Self {
        let mut column_schema_id = AHashMap::new();
        for (schema_id, field) in header.index_fields() {
            column_schema_id.insert(field.clone(), *schema_id);
        }
        let all_in_index = !columns.is_empty()
            && columns.iter().all(|c| column_schema_id.contains_key(c));
        Self {
            header,
            index,
            codec,
            columns,
            column_schema_id,
            all_in_index,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    // ========== WHOLE-DATASET ENUMERATION (row-mode planning) ==========

    /// Query every shard's index in parallel, one thread per shard, and
    /// materialise per-row locations and labels in `ROW_ID` order.
    pub fn read_all_row_groups(&self) -> Result<Vec<(Vec<RowMeta>, Vec<Value>)>> {
        let mut fields = "ROW_GROUP_ID, PAGE_OFFSET_BLOB, PAGE_OFFSET_BLOB_END".to_string();
        if self.all_in_index {
            for col in &self.columns {
                fields.push_str(", ");
                fields.push_str(&self.indexed_column(col)?);
            }
        } else {
            // some field is not indexed, fetch the RAW page locations too
            fields.push_str(", PAGE_ID_RAW, PAGE_OFFSET_RAW, PAGE_OFFSET_RAW_END");
        }
        let sql = format!("SELECT {} FROM INDEXES ORDER BY ROW_ID", fields);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..self.header.shard_count())
                .map(|shard_id| {
                    let sql = sql.as_str();
                    scope.spawn(move || self.read_rows_in_shard(shard_id, sql))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }

    fn read_rows_in_shard(&self, shard_id: usize, sql: &str) -> Result<(Vec<RowMeta>, Vec<Value>)> {
        let rows = self.index[shard_id].query(sql)?;
        log::debug!("fetched {} index records from shard {}", rows.len(), shard_id);
        let mut fs = if self.all_in_index {
            None
        } else {
            Some(BlobFile::open(&self.header.shard_addresses()[shard_id])?)
        };
        self.convert_labels(&rows, fs.as_mut())
    }

    /// Turn raw index rows into row locations plus label JSON. `fs` is
    /// only needed on the raw-page path.
    fn convert_labels(
        &self,
        rows: &[Vec<String>],
        mut fs: Option<&mut BlobFile>,
    ) -> Result<(Vec<RowMeta>, Vec<Value>)> {
        let mut metas = Vec::with_capacity(rows.len());
        let mut labels = Vec::with_capacity(rows.len());
        for cells in rows {
            let group_id = parse_cell(cells, 0)?;
            let start = parse_cell(cells, 1)? + INT64_LEN;
            let end = parse_cell(cells, 2)?;
            metas.push(RowMeta {
                group_id,
                start,
                end,
            });
            if self.all_in_index {
                labels.push(self.cast_columns(cells, 3)?);
            } else {
                let fs = fs.as_mut().ok_or_else(|| {
                    MindRecordError::Decode("raw-page label path needs a shard file".to_string())
                })?;
                labels.push(self.decode_raw_record(fs, cells, 3)?);
            }
        }
        Ok((metas, labels))
    }

    // ========== PER-PAGE RESOLUTION (block mode, category planning) ==========

    /// Offsets and labels of the BLOB page backing `group_id`.
    pub fn row_group_brief(&self, group_id: u64, shard_id: usize) -> Result<RowGroupBrief> {
        self.brief(group_id, shard_id, None)
    }

    /// Like [`Self::row_group_brief`] but restricted to rows matching a
    /// `(field, value)` criteria pair.
    pub fn row_group_criteria(
        &self,
        group_id: u64,
        shard_id: usize,
        criteria: &(String, String),
    ) -> Result<RowGroupBrief> {
        if !self.header.has_column(&criteria.0) {
            return Err(MindRecordError::IllegalColumnList(format!(
                "criteria field {:?} is in no schema",
                criteria.0
            )));
        }
        self.brief(group_id, shard_id, Some(criteria))
    }

    fn brief(
        &self,
        group_id: u64,
        shard_id: usize,
        criteria: Option<&(String, String)>,
    ) -> Result<RowGroupBrief> {
        let page = self.header.page_by_group(group_id, shard_id)?;
        let page_offset = self.header.page_size() * page.page_id + self.header.header_size();
        let offsets = self.blob_offsets(page.page_id, shard_id, criteria)?;
        let labels = self.labels(page.page_id, shard_id, criteria)?;
        Ok(RowGroupBrief {
            page_length: page.page_size,
            page_offset,
            offsets,
            labels,
        })
    }

    /// Payload byte ranges of rows in a BLOB page, relative to the page
    /// start.
    pub fn blob_offsets(
        &self,
        page_id: u64,
        shard_id: usize,
        criteria: Option<&(String, String)>,
    ) -> Result<Vec<(u64, u64)>> {
        let mut sql = format!(
            "SELECT PAGE_OFFSET_BLOB, PAGE_OFFSET_BLOB_END FROM INDEXES WHERE PAGE_ID_BLOB = {}",
            page_id
        );
        let bind = self.push_criteria(&mut sql, criteria)?;
        sql.push_str(" ORDER BY ROW_ID");
        let rows = self.query(shard_id, &sql, bind)?;
        let mut offsets = Vec::with_capacity(rows.len());
        for cells in &rows {
            let start = parse_cell(cells, 0)? + INT64_LEN;
            let end = parse_cell(cells, 1)?;
            if end < start {
                return Err(MindRecordError::FormatMismatch(format!(
                    "inverted blob record range [{}, {})",
                    start, end
                )));
            }
            offsets.push((start, end));
        }
        Ok(offsets)
    }

    /// Labels of rows in a BLOB page, through whichever path the column
    /// selection allows.
    pub fn labels(
        &self,
        page_id: u64,
        shard_id: usize,
        criteria: Option<&(String, String)>,
    ) -> Result<Vec<Value>> {
        if self.all_in_index {
            self.labels_from_index(page_id, shard_id, criteria)
        } else {
            self.labels_from_page(page_id, shard_id, criteria)
        }
    }

    fn labels_from_index(
        &self,
        page_id: u64,
        shard_id: usize,
        criteria: Option<&(String, String)>,
    ) -> Result<Vec<Value>> {
        let fields = self
            .columns
            .iter()
            .map(|c| self.indexed_column(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let mut sql = format!(
            "SELECT {} FROM INDEXES WHERE PAGE_ID_BLOB = {}",
            fields, page_id
        );
        let bind = self.push_criteria(&mut sql, criteria)?;
        sql.push_str(" ORDER BY ROW_ID");
        let rows = self.query(shard_id, &sql, bind)?;
        rows.iter().map(|cells| self.cast_columns(cells, 0)).collect()
    }

    fn labels_from_page(
        &self,
        page_id: u64,
        shard_id: usize,
        criteria: Option<&(String, String)>,
    ) -> Result<Vec<Value>> {
        let mut sql = format!(
            "SELECT PAGE_ID_RAW, PAGE_OFFSET_RAW, PAGE_OFFSET_RAW_END \
             FROM INDEXES WHERE PAGE_ID_BLOB = {}",
            page_id
        );
        let bind = self.push_criteria(&mut sql, criteria)?;
        sql.push_str(" ORDER BY ROW_ID");
        let rows = self.query(shard_id, &sql, bind)?;

        let mut fs = BlobFile::open(&self.header.shard_addresses()[shard_id])?;
        rows.iter()
            .map(|cells| self.decode_raw_record(&mut fs, cells, 0))
            .collect()
    }

    // ========== HELPERS ==========

    fn query(
        &self,
        shard_id: usize,
        sql: &str,
        bind: Option<String>,
    ) -> Result<Vec<Vec<String>>> {
        match bind {
            Some(value) => self.index[shard_id].query_with_criteria(sql, &value),
            None => self.index[shard_id].query(sql),
        }
    }

    /// Index column name of a selected field: `<field>_<schema_id>`.
    fn indexed_column(&self, column: &str) -> Result<String> {
        let schema_id = self.column_schema_id.get(column).ok_or_else(|| {
            MindRecordError::IllegalColumnList(format!("column {:?} is not indexed", column))
        })?;
        Ok(format!("{}_{}", column, schema_id))
    }

    /// Append the criteria clause. Numeric values interpolate unquoted
    /// (after a parse check); everything else binds as `:criteria`.
    fn push_criteria(
        &self,
        sql: &mut String,
        criteria: Option<&(String, String)>,
    ) -> Result<Option<String>> {
        let Some((field, value)) = criteria else {
            return Ok(None);
        };
        let column = self.indexed_column(field)?;
        let numeric = self
            .header
            .field_type(field)
            .map(|t| t.is_number())
            .unwrap_or(false);
        if numeric {
            if value.parse::<f64>().is_err() {
                return Err(MindRecordError::Decode(format!(
                    "criteria value {:?} is not numeric for field {:?}",
                    value, field
                )));
            }
            sql.push_str(&format!(" AND {} = {}", column, value));
            Ok(None)
        } else {
            sql.push_str(&format!(" AND {} = :criteria", column));
            Ok(Some(value.clone()))
        }
    }

    /// Build one label object from indexed cells starting at `offset`,
    /// casting each cell to its declared schema type.
    fn cast_columns(&self, cells: &[String], offset: usize) -> Result<Value> {
        let mut object = Map::with_capacity(self.columns.len());
        for (j, column) in self.columns.iter().enumerate() {
            let field_type = self.header.field_type(column).ok_or_else(|| {
                MindRecordError::IllegalColumnList(format!("column {:?} is in no schema", column))
            })?;
            let cell = cells.get(offset + j).ok_or_else(|| {
                MindRecordError::Decode(format!("index row is missing cell for {:?}", column))
            })?;
            object.insert(column.clone(), field_type.cast(cell)?);
        }
        Ok(Value::Object(object))
    }

    /// Read and decode one RAW record addressed by a
    /// `(PAGE_ID_RAW, PAGE_OFFSET_RAW, PAGE_OFFSET_RAW_END)` triple
    /// starting at `offset` within `cells`, projected to the selected
    /// columns.
    fn decode_raw_record(
        &self,
        fs: &mut BlobFile,
        cells: &[String],
        offset: usize,
    ) -> Result<Value> {
        let raw_page_id = parse_cell(cells, offset)?;
        let label_start = parse_cell(cells, offset + 1)? + INT64_LEN;
        let label_end = parse_cell(cells, offset + 2)?;
        let len = label_end.checked_sub(label_start).ok_or_else(|| {
            MindRecordError::FormatMismatch(format!(
                "inverted raw record range [{}, {})",
                label_start, label_end
            ))
        })?;
        let file_offset =
            self.header.page_size() * raw_page_id + self.header.header_size() + label_start;
        let raw = fs.read_at(file_offset, len as usize)?;
        let decoded = self.codec.decode(&raw)?;
        Ok(self.project(decoded))
    }

    /// Project a decoded record to the selected columns; an empty
    /// selection keeps the full record.
    fn project(&self, decoded: Value) -> Value {
        if self.columns.is_empty() {
            return decoded;
        }
        let mut object = Map::with_capacity(self.columns.len());
        if let Value::Object(fields) = decoded {
            for column in &self.columns {
                if let Some(value) = fields.get(column) {
                    object.insert(column.clone(), value.clone());
                }
            }
        }
        Value::Object(object)
    }
}

fn parse_cell(cells: &[String], index: usize) -> Result<u64> {
    let cell = cells
        .get(index)
        .ok_or_else(|| MindRecordError::Decode(format!("index row is missing cell {}", index)))?;
    cell.parse::<u64>().map_err(|_| {
        MindRecordError::Decode(format!("invalid offset literal in index row: {:?}", cell))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cell() {
        let cells = vec!["12".to_string(), "x".to_string()];
        assert_eq!(parse_cell(&cells, 0).unwrap(), 12);
        assert!(parse_cell(&cells, 1).is_err());
        assert!(parse_cell(&cells, 2).is_err());
    }
}
