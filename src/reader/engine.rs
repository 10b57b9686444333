//! Streaming engine
//!
//! Workers share one atomic task counter and deliver results through a
//! bounded in-order buffer guarded by one mutex and two condvars: workers
//! park on `cv_delivery` when they run too far ahead of the consumer, the
//! consumer parks on `cv_iterator` until the batch it expects next is
//! present. Results surface strictly in ascending task-id order. A worker
//! failure poisons the stream: the error is stored, the interrupt flag is
//! raised, and the next consumer call returns the error instead of
//! hanging.

use super::labels::LabelResolver;
use super::{RowBatch, NUM_BATCH_IN_MAP, NUM_PAGE_IN_BUFFER};
use crate::blob::BlobFile;
use crate::format::ShardHeader;
use crate::task::{TaskAddress, TaskList};
use crate::{MindRecordError, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const WORKER_NAME_PREFIX: &str = "mr-consumer-";

/// State behind the delivery mutex.
#[derive(Default)]
struct DeliveryState {
    interrupt: bool,
    deliver_id: usize,
    batches: BTreeMap<usize, RowBatch>,
    ready_blocks: HashSet<usize>,
    failure: Option<MindRecordError>,
}

struct Shared {
    state: Mutex<DeliveryState>,
    /// Workers wait here for backpressure room or the next epoch
    cv_delivery: Condvar,
    /// The consumer waits here for its next task id
    cv_iterator: Condvar,
    task_id: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(DeliveryState::default()),
            cv_delivery: Condvar::new(),
            cv_iterator: Condvar::new(),
            task_id: AtomicUsize::new(0),
        }
    }

    /// Record a worker failure and wake everyone.
    fn poison(&self, error: MindRecordError) {
        {
            let mut st = self.state.lock();
            st.failure.get_or_insert(error);
            st.interrupt = true;
        }
        self.cv_delivery.notify_all();
        self.cv_iterator.notify_all();
    }
}

/// One slot of the block-mode ring: page bytes plus the row offsets and
/// labels needed to slice them. Owned by the filling worker until the
/// consumer advances past the slot.
#[derive(Default)]
struct BlockSlot {
    bytes: Vec<u8>,
    offsets: Vec<(u64, u64)>,
    labels: Vec<Value>,
}

pub(crate) struct Engine {
    shared: Arc<Shared>,
    tasks: Arc<RwLock<TaskList>>,
    slots: Arc<Vec<Mutex<BlockSlot>>>,
    workers: Vec<JoinHandle<()>>,
    block_reader: bool,
    num_blocks: usize,
    /// Consumer cursor within the block currently being drained
    row_id: usize,
}

impl Engine {
    pub fn new(tasks: TaskList, block_reader: bool) -> Self {
        let num_blocks = if block_reader { tasks.len() } else { 0 };
        let slots = if block_reader {
            (0..NUM_PAGE_IN_BUFFER)
                .map(|_| Mutex::new(BlockSlot::default()))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            shared: Arc::new(Shared::new()),
            tasks: Arc::new(RwLock::new(tasks)),
            slots: Arc::new(slots),
            workers: Vec::new(),
            block_reader,
            num_blocks,
            row_id: 0,
        }
    }

    pub fn tasks(&self) -> &Arc<RwLock<TaskList>> {
        &self.tasks
    }

    pub fn interrupted(&self) -> bool {
        self.shared.state.lock().interrupt
    }

    // ========== WORKER LAUNCH ==========

    /// Spawn row-mode workers; each takes ownership of its own row of
    /// shard file handles.
    pub fn launch_row(
        &mut self,
        header: Arc<ShardHeader>,
        handle_matrix: Vec<Vec<BlobFile>>,
    ) -> Result<()> {
        for (worker_id, handles) in handle_matrix.into_iter().enumerate() {
            let shared = Arc::clone(&self.shared);
            let tasks = Arc::clone(&self.tasks);
            let header = Arc::clone(&header);
            let worker = thread::Builder::new()
                .name(format!("{}{}", WORKER_NAME_PREFIX, worker_id))
                .spawn(move || row_worker(shared, tasks, header, handles, worker_id))?;
            self.workers.push(worker);
        }
        Ok(())
    }

    /// Spawn block-mode workers over the shared per-shard handles.
    pub fn launch_block(
        &mut self,
        resolver: Arc<LabelResolver>,
        files: Arc<Vec<Mutex<BlobFile>>>,
        n_consumer: usize,
    ) -> Result<()> {
        for worker_id in 0..n_consumer {
            let shared = Arc::clone(&self.shared);
            let tasks = Arc::clone(&self.tasks);
            let resolver = Arc::clone(&resolver);
            let files = Arc::clone(&files);
            let slots = Arc::clone(&self.slots);
            let num_blocks = self.num_blocks;
            let worker = thread::Builder::new()
                .name(format!("{}{}", WORKER_NAME_PREFIX, worker_id))
                .spawn(move || {
                    block_worker(shared, tasks, resolver, files, slots, num_blocks, worker_id)
                })?;
            self.workers.push(worker);
        }
        Ok(())
    }

    // ========== CONSUMER SIDE ==========

    pub fn get_next(&mut self) -> Result<RowBatch> {
        if self.block_reader {
            return self.get_block_next();
        }
        let total = self.tasks.read().len();
        let mut st = self.shared.state.lock();
        loop {
            if let Some(error) = st.failure.take() {
                return Err(error);
            }
            if st.interrupt {
                return Ok(Vec::new());
            }
            if st.deliver_id >= total {
                return Ok(Vec::new());
            }
            let deliver_id = st.deliver_id;
            if let Some(batch) = st.batches.remove(&deliver_id) {
                st.deliver_id += 1;
                drop(st);
                self.shared.cv_delivery.notify_all();
                return Ok(batch);
            }
            self.shared.cv_iterator.wait(&mut st);
        }
    }

    pub fn get_block_next(&mut self) -> Result<RowBatch> {
        loop {
            let deliver_id;
            {
                let mut st = self.shared.state.lock();
                loop {
                    if let Some(error) = st.failure.take() {
                        return Err(error);
                    }
                    if st.interrupt {
                        return Ok(Vec::new());
                    }
                    if st.deliver_id >= self.num_blocks {
                        return Ok(Vec::new());
                    }
                    // mid-block rows need no wait, the slot is already full
                    if self.row_id != 0 || st.ready_blocks.contains(&st.deliver_id) {
                        break;
                    }
                    self.shared.cv_iterator.wait(&mut st);
                }
                deliver_id = st.deliver_id;
            }

            let buf_id = deliver_id % NUM_PAGE_IN_BUFFER;
            let (batch, rows_in_block) = {
                let slot = self.slots[buf_id].lock();
                if slot.offsets.is_empty() {
                    (None, 0)
                } else {
                    let (start, end) = slot.offsets[self.row_id];
                    if start > end || end as usize > slot.bytes.len() {
                        return Err(MindRecordError::FormatMismatch(format!(
                            "blob record range [{}, {}) exceeds the {}-byte page",
                            start,
                            end,
                            slot.bytes.len()
                        )));
                    }
                    let bytes = slot.bytes[start as usize..end as usize].to_vec();
                    let labels = slot.labels[self.row_id].clone();
                    (Some(vec![(bytes, labels)]), slot.offsets.len())
                }
            };

            match batch {
                Some(batch) => {
                    self.row_id += 1;
                    if self.row_id == rows_in_block {
                        self.finish_block(deliver_id);
                    }
                    return Ok(batch);
                }
                // an empty page produced no rows, release the slot and move on
                None => self.finish_block(deliver_id),
            }
        }
    }

    fn finish_block(&mut self, deliver_id: usize) {
        self.row_id = 0;
        {
            let mut st = self.shared.state.lock();
            st.ready_blocks.remove(&deliver_id);
            st.deliver_id = deliver_id + 1;
        }
        self.shared.cv_delivery.notify_all();
    }

    // ========== LIFECYCLE ==========

    /// Rewind both counters for the next epoch. Block-mode workers are
    /// parked past `num_blocks` and resume; row-mode workers have exited
    /// and a fresh launch respawns them.
    pub fn reset(&mut self) {
        {
            let mut st = self.shared.state.lock();
            self.shared.task_id.store(0, Ordering::SeqCst);
            st.deliver_id = 0;
            st.batches.clear();
            st.ready_blocks.clear();
        }
        self.row_id = 0;
        self.shared.cv_delivery.notify_all();
    }

    /// Interrupt the stream and join every worker. Idempotent.
    pub fn finish(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.interrupt = true;
        }
        self.shared.cv_delivery.notify_all();
        self.shared.cv_iterator.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.finish();
    }
}

// ========== WORKER LOOPS ==========

fn row_worker(
    shared: Arc<Shared>,
    tasks: Arc<RwLock<TaskList>>,
    header: Arc<ShardHeader>,
    mut handles: Vec<BlobFile>,
    worker_id: usize,
) {
    loop {
        let task_id = shared.task_id.fetch_add(1, Ordering::SeqCst);
        if task_id >= tasks.read().len() {
            log::debug!("worker {} drained the task list", worker_id);
            return;
        }
        let batch = match consume_one_task(&tasks, &header, &mut handles, task_id) {
            Ok(batch) => batch,
            Err(error) => {
                log::error!("worker {} failed on task {}: {}", worker_id, task_id, error);
                shared.poison(error);
                return;
            }
        };
        {
            let mut st = shared.state.lock();
            while !(st.interrupt || task_id <= st.deliver_id + NUM_BATCH_IN_MAP) {
                shared.cv_delivery.wait(&mut st);
            }
            if st.interrupt {
                return;
            }
            st.batches.insert(task_id, batch);
        }
        shared.cv_iterator.notify_one();
    }
}

/// Resolve, read, and package one row task. Shared by pool workers and
/// the externally-dispatched simple-reader path.
pub(crate) fn consume_one_task(
    tasks: &RwLock<TaskList>,
    header: &ShardHeader,
    handles: &mut [BlobFile],
    task_id: usize,
) -> Result<RowBatch> {
    let (shard_id, group_id, start, end, labels) = {
        let guard = tasks.read();
        let task = guard.permuted(task_id).ok_or_else(|| {
            MindRecordError::CapacityExceeded(format!(
                "task id {} is beyond the task list",
                task_id
            ))
        })?;
        match task.address {
            TaskAddress::Blob { start, end } => {
                (task.shard_id, task.group_id, start, end, task.labels.clone())
            }
            TaskAddress::Rows(_) => {
                return Err(MindRecordError::FormatMismatch(
                    "block task dispatched to the row path".to_string(),
                ))
            }
        }
    };
    let page = header.page_by_group(group_id, shard_id)?;
    let len = end.checked_sub(start).ok_or_else(|| {
        MindRecordError::FormatMismatch(format!(
            "inverted blob record range [{}, {})",
            start, end
        ))
    })?;
    let file_offset = header.header_size() + header.page_size() * page.page_id + start;
    let bytes = handles[shard_id].read_at(file_offset, len as usize)?;
    Ok(vec![(bytes, labels)])
}

fn block_worker(
    shared: Arc<Shared>,
    tasks: Arc<RwLock<TaskList>>,
    resolver: Arc<LabelResolver>,
    files: Arc<Vec<Mutex<BlobFile>>>,
    slots: Arc<Vec<Mutex<BlockSlot>>>,
    num_blocks: usize,
    worker_id: usize,
) {
    loop {
        let task_id = shared.task_id.fetch_add(1, Ordering::SeqCst);

        // past the epoch: park until a reset rewinds the counter
        if task_id >= num_blocks {
            let mut st = shared.state.lock();
            while !(st.interrupt || shared.task_id.load(Ordering::SeqCst) < num_blocks) {
                shared.cv_delivery.wait(&mut st);
            }
            if st.interrupt {
                return;
            }
            continue;
        }

        let (shard_id, group_id) = {
            let guard = tasks.read();
            match guard.permuted(task_id) {
                Some(task) => (task.shard_id, task.group_id),
                None => {
                    shared.poison(MindRecordError::CapacityExceeded(format!(
                        "task id {} is beyond the task list",
                        task_id
                    )));
                    return;
                }
            }
        };
        let brief = match resolver.row_group_brief(group_id, shard_id) {
            Ok(brief) => brief,
            Err(error) => {
                log::error!("worker {} failed on block {}: {}", worker_id, task_id, error);
                shared.poison(error);
                return;
            }
        };

        {
            let mut st = shared.state.lock();
            while !(st.interrupt || task_id < st.deliver_id + NUM_PAGE_IN_BUFFER) {
                shared.cv_delivery.wait(&mut st);
            }
            if st.interrupt {
                return;
            }
        }

        let buf_id = task_id % NUM_PAGE_IN_BUFFER;
        {
            let mut slot = slots[buf_id].lock();
            let bytes = {
                let mut file = files[shard_id].lock();
                file.read_at(brief.page_offset, brief.page_length as usize)
            };
            match bytes {
                Ok(bytes) => {
                    slot.bytes = bytes;
                    slot.offsets = brief.offsets;
                    slot.labels = brief.labels;
                }
                Err(error) => {
                    drop(slot);
                    log::error!(
                        "worker {} failed reading block {}: {}",
                        worker_id,
                        task_id,
                        error
                    );
                    shared.poison(error);
                    return;
                }
            }
        }

        {
            let mut st = shared.state.lock();
            st.ready_blocks.insert(task_id);
        }
        shared.cv_iterator.notify_one();
    }
}
