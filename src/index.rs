//! Per-shard index databases
//!
//! Every shard file has a sidecar SQLite database of the same stem plus a
//! `.db` suffix. The database is opened read-only, verified against the
//! shard file basename through its `SHARD_NAME` table, and then only ever
//! queried. One connection is held per shard for the reader's lifetime;
//! planner threads and block-mode workers serialise on it.

use crate::{MindRecordError, Result};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{named_params, Connection, OpenFlags};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// SQL column-count cap per query.
pub const MAX_FIELD_COUNT: usize = 100;

/// Read-only handle to one shard's index database.
#[derive(Debug)]
pub struct IndexDb {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl IndexDb {
    /// Open the sidecar database of `shard_path` and verify that its
    /// `SHARD_NAME` table names that shard file.
    pub fn open(shard_path: &Path) -> Result<Self> {
        let mut os: OsString = shard_path.as_os_str().to_os_string();
        os.push(".db");
        let path = PathBuf::from(os);
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        log::debug!("opened index database {}", path.display());

        let recorded: String = conn.query_row("SELECT NAME FROM SHARD_NAME", [], |row| row.get(0))?;
        let expected = shard_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if recorded != expected {
            return Err(MindRecordError::FormatMismatch(format!(
                "index database {} names shard {:?}, expected {:?}",
                path.display(),
                recorded,
                expected
            )));
        }
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a statement and return every row as text cells, NULLs as
    /// empty strings.
    pub fn query(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        self.run(sql, None)
    }

    /// Run a statement carrying a `:criteria` placeholder.
    pub fn query_with_criteria(&self, sql: &str, criteria: &str) -> Result<Vec<Vec<String>>> {
        self.run(sql, Some(criteria))
    }

    fn run(&self, sql: &str, criteria: Option<&str>) -> Result<Vec<Vec<String>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let ncols = stmt.column_count();
        if ncols > MAX_FIELD_COUNT {
            return Err(MindRecordError::CapacityExceeded(format!(
                "query selects {} columns, limit is {}",
                ncols, MAX_FIELD_COUNT
            )));
        }
        let mut rows = match criteria {
            Some(value) => stmt.query(named_params! {":criteria": value})?,
            None => stmt.query([])?,
        };
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(ncols);
            for i in 0..ncols {
                cells.push(cell_to_string(row.get_ref(i)?));
            }
            records.push(cells);
        }
        Ok(records)
    }
}

/// Text coercion matching `sqlite3_column_text`: typed cells print their
/// value, NULL and BLOB cells become empty strings.
fn cell_to_string(cell: ValueRef<'_>) -> String {
    match cell {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(_) => String::new(),
    }
}
