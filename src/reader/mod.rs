//! Shard reader facade
//!
//! Owns every resource of one open dataset: the parsed header, one index
//! database per shard, the shard file handles for the chosen mode, the
//! operators, and the streaming engine. `open` validates and wires
//! everything, `launch` plans tasks and spawns workers, `get_next` pulls
//! ordered results, `close` tears down in reverse acquisition order.

pub(crate) mod engine;
pub(crate) mod labels;
pub(crate) mod planner;

use crate::blob::{self, BlobFile};
use crate::codec::{MsgpackCodec, RecordCodec};
use crate::format::ShardHeader;
use crate::index::IndexDb;
use crate::operator::Operator;
use crate::{MindRecordError, Result};
use engine::Engine;
use labels::LabelResolver;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::thread;

pub use planner::RowGroupSummary;

/// Maximum supported shard count; planning fails beyond it.
pub const MAX_SHARD_COUNT: usize = 1280;
/// Worker-count clamp bounds.
pub const MAX_CONSUMER_COUNT: usize = 128;
pub const MIN_CONSUMER_COUNT: usize = 4;
/// Row-mode delivery backlog bound.
pub const NUM_BATCH_IN_MAP: usize = 64;
/// Block-mode ring size.
pub const NUM_PAGE_IN_BUFFER: usize = 16;

/// One delivered batch: `(blob_bytes, labels)` pairs. Empty signals
/// end-of-stream or interruption.
pub type RowBatch = Vec<(Vec<u8>, Value)>;

/// Parallel reader over one sharded dataset.
pub struct ShardReader {
    header: Arc<ShardHeader>,
    index: Option<Arc<Vec<IndexDb>>>,
    resolver: Option<Arc<LabelResolver>>,
    operators: Vec<Operator>,
    n_consumer: usize,
    block_reader: bool,
    num_rows: usize,
    num_blocks: usize,
    engine: Option<Engine>,
    /// Row-mode handle matrix `[worker][shard]`, consumed by a pooled
    /// launch, retained for the simple-reader path
    row_files: Option<Vec<Vec<BlobFile>>>,
    /// Block-mode shared handles, one per shard
    block_files: Option<Arc<Vec<Mutex<BlobFile>>>>,
}

impl std::fmt::Debug for ShardReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReader").finish_non_exhaustive()
    }
}

impl ShardReader {
    /// Open a dataset through any one of its shard files.
    ///
    /// Parses the header, opens and verifies every index database,
    /// strips blob-field names from `selected_columns`, validates the
    /// remainder against the schemas, and opens the shard file handles
    /// for the chosen mode.
    pub fn open(
        path: impl AsRef<Path>,
        n_consumer: usize,
        selected_columns: Vec<String>,
        operators: Vec<Operator>,
        block_reader: bool,
    ) -> Result<Self> {
        Self::open_with_codec(
            path,
            n_consumer,
            selected_columns,
            operators,
            block_reader,
            Arc::new(MsgpackCodec),
        )
    }

    /// [`Self::open`] with a caller-supplied record codec for RAW pages.
    pub fn open_with_codec(
        path: impl AsRef<Path>,
        n_consumer: usize,
        selected_columns: Vec<String>,
        operators: Vec<Operator>,
        block_reader: bool,
        codec: Arc<dyn RecordCodec>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let header = Arc::new(ShardHeader::build(path)?);
        let mut databases = Vec::with_capacity(header.shard_count());
        for shard_path in header.shard_addresses() {
            databases.push(IndexDb::open(shard_path)?);
        }
        let index = Arc::new(databases);

        let summary = planner::read_row_group_summary(&header)?;
        let num_rows = summary.iter().map(|rg| rg.row_count).sum::<u64>() as usize;
        log::info!(
            "opened dataset {}: {} shards, {} rows",
            path.display(),
            header.shard_count(),
            num_rows
        );

        let n_consumer = clamp_consumers(n_consumer);

        // blob payloads are streamed, never resolved as labels
        let blob_fields = header.blob_fields();
        let selected: Vec<String> = selected_columns
            .into_iter()
            .filter(|c| !blob_fields.contains(c))
            .collect();
        check_column_list(&header, &selected)?;

        let resolver = Arc::new(LabelResolver::new(
            Arc::clone(&header),
            Arc::clone(&index),
            codec,
            selected,
        ));

        let (row_files, block_files) = if block_reader {
            let shared = blob::open_shared(header.shard_addresses())?;
            (None, Some(Arc::new(shared)))
        } else {
            let matrix = blob::open_matrix(header.shard_addresses(), n_consumer)?;
            (Some(matrix), None)
        };

        Ok(Self {
            header,
            index: Some(index),
            resolver: Some(resolver),
            operators,
            n_consumer,
            block_reader,
            num_rows,
            num_blocks: 0,
            engine: None,
            row_files,
            block_files,
        })
    }

    /// Enumerate every BLOB page of the dataset, sorted by
    /// `(group_id, shard_id)`.
    pub fn row_group_summary(&self) -> Result<Vec<RowGroupSummary>> {
        planner::read_row_group_summary(&self.header)
    }

    /// Count the dataset's rows without constructing a streaming reader.
    pub fn count_total_rows(path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let header = ShardHeader::build(path)?;
        for shard_path in header.shard_addresses() {
            IndexDb::open(shard_path)?;
        }
        let summary = planner::read_row_group_summary(&header)?;
        Ok(summary.iter().map(|rg| rg.row_count).sum::<u64>() as usize)
    }

    // ========== LIFECYCLE ==========

    /// Plan the task list and spawn workers. With `simple_reader` no
    /// workers start; the host dispatches through [`Self::get_next_by_id`].
    /// Calling `launch` again after an epoch re-plans (re-applying the
    /// operators) and respawns the pool.
    pub fn launch(&mut self, simple_reader: bool) -> Result<()> {
        if let Some(mut old) = self.engine.take() {
            old.finish();
        }
        let resolver = self.resolver()?.clone();
        let summary = planner::read_row_group_summary(&self.header)?;
        let tasks =
            planner::plan_tasks(&summary, &resolver, &mut self.operators, self.block_reader)
                .map_err(|error| {
                    log::error!("failed to plan read tasks: {}", error);
                    error
                })?;
        self.num_rows = if self.block_reader {
            tasks.size_of_rows() as usize
        } else {
            tasks.len()
        };
        self.num_blocks = if self.block_reader { tasks.len() } else { 0 };
        log::info!(
            "planned {} tasks over {} rows",
            tasks.len(),
            self.num_rows
        );

        let mut engine = Engine::new(tasks, self.block_reader);
        if !simple_reader {
            if self.block_reader {
                let files = self
                    .block_files
                    .clone()
                    .ok_or(MindRecordError::Interrupted)?;
                engine.launch_block(resolver, files, self.n_consumer)?;
            } else {
                let files = match self.row_files.take() {
                    Some(files) => files,
                    // respawning after a previous pooled epoch
                    None => blob::open_matrix(self.header.shard_addresses(), self.n_consumer)?,
                };
                engine.launch_row(Arc::clone(&self.header), files)?;
            }
            log::info!("launched {} read workers", self.n_consumer);
        }
        self.engine = Some(engine);
        Ok(())
    }

    /// Pull the next batch in planned order. Empty output signals
    /// end-of-stream or interruption; a worker failure surfaces here as
    /// an error.
    pub fn get_next(&mut self) -> Result<RowBatch> {
        match self.engine.as_mut() {
            Some(engine) => engine.get_next(),
            None => Ok(Vec::new()),
        }
    }

    /// Stateless dispatch for hosts that parallelise externally: resolve
    /// and read one task directly on the caller's thread, bypassing the
    /// pool. Requires a `simple_reader` launch in row mode.
    pub fn get_next_by_id(&mut self, task_id: usize, consumer_id: usize) -> Result<RowBatch> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(Vec::new());
        };
        if engine.interrupted() {
            return Ok(Vec::new());
        }
        if self.block_reader {
            return engine.get_block_next();
        }
        let files = self.row_files.as_mut().ok_or_else(|| {
            MindRecordError::CapacityExceeded(
                "file handles are owned by the worker pool; use get_next".to_string(),
            )
        })?;
        let handles = files.get_mut(consumer_id).ok_or_else(|| {
            MindRecordError::CapacityExceeded(format!(
                "consumer id {} is beyond the {} opened handle sets",
                consumer_id,
                self.n_consumer
            ))
        })?;
        engine::consume_one_task(engine.tasks(), &self.header, handles, task_id)
    }

    /// Rewind to the start of the epoch. Block-mode workers resume from
    /// their parking wait; call between epochs, not mid-stream.
    pub fn reset(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.reset();
        }
    }

    /// Re-apply the shuffle operators to the planned tasks. Skipped
    /// entirely in block mode; call between epochs.
    pub fn shuffle_task(&mut self) -> Result<()> {
        if self.block_reader {
            return Ok(());
        }
        let Some(engine) = self.engine.as_ref() else {
            return Ok(());
        };
        let mut tasks = engine.tasks().write();
        for op in self.operators.iter_mut().filter(|op| op.is_shuffle()) {
            if let Err(error) = op.apply(&mut tasks) {
                log::warn!("reshuffling reader tasks failed: {}", error);
            }
        }
        Ok(())
    }

    /// Interrupt the stream and join every worker. Idempotent.
    pub fn finish(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.finish();
        }
    }

    /// Stop streaming and release every resource in reverse acquisition
    /// order: workers, file handles, then index databases. Idempotent.
    pub fn close(&mut self) {
        self.finish();
        self.engine = None;
        self.block_files = None;
        self.row_files = None;
        self.resolver = None;
        self.index = None;
    }

    // ========== GETTERS ==========

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn shard_count(&self) -> usize {
        self.header.shard_count()
    }

    pub fn shard_header(&self) -> &ShardHeader {
        &self.header
    }

    pub fn blob_fields(&self) -> Vec<String> {
        self.header.blob_fields()
    }

    pub fn selected_columns(&self) -> &[String] {
        self.resolver
            .as_ref()
            .map(|r| r.columns())
            .unwrap_or_default()
    }

    fn resolver(&self) -> Result<&Arc<LabelResolver>> {
        self.resolver
            .as_ref()
            .ok_or(MindRecordError::Interrupted)
    }
}

impl Drop for ShardReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Clamp the requested worker count to `[MIN_CONSUMER_COUNT,
/// min(available_parallelism, MAX_CONSUMER_COUNT)]`, minimum bound
/// winning on small machines.
fn clamp_consumers(n_consumer: usize) -> usize {
    let thread_limit = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_CONSUMER_COUNT);
    n_consumer
        .min(thread_limit)
        .min(MAX_CONSUMER_COUNT)
        .max(MIN_CONSUMER_COUNT)
}

/// Every selected column must appear in at least one schema.
fn check_column_list(header: &ShardHeader, columns: &[String]) -> Result<()> {
    for column in columns {
        if !header.has_column(column) {
            return Err(MindRecordError::IllegalColumnList(format!(
                "column {:?} is in no schema",
                column
            )));
        }
    }
    Ok(())
}
