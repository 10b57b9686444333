//! Task model
//!
//! A task is one unit of streaming work: a single row in row mode, a
//! whole BLOB page in block mode. Tasks own no I/O; they are plan
//! entries. The task list carries a permutation over `0..len` which is
//! the sole knob operators use to reorder delivery without rewriting the
//! tasks themselves.

use serde_json::Value;

/// Work address of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAddress {
    /// Row mode: a byte range inside the row group's BLOB page. `start`
    /// already points past the record length prefix; `end > start`.
    Blob { start: u64, end: u64 },
    /// Block mode: the number of rows in the page.
    Rows(u64),
}

/// One plan entry.
#[derive(Debug, Clone)]
pub struct Task {
    pub shard_id: usize,
    pub group_id: u64,
    pub address: TaskAddress,
    pub labels: Value,
}

/// Ordered task list plus its delivery permutation.
#[derive(Debug, Clone, Default)]
pub struct TaskList {
    tasks: Vec<Task>,
    permutation: Vec<usize>,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task and return its index.
    pub fn insert(
        &mut self,
        shard_id: usize,
        group_id: u64,
        address: TaskAddress,
        labels: Value,
    ) -> usize {
        self.tasks.push(Task {
            shard_id,
            group_id,
            address,
            labels,
        });
        self.tasks.len() - 1
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Total row count across tasks: block tasks contribute their row
    /// count, row tasks contribute one row each.
    pub fn size_of_rows(&self) -> u64 {
        self.tasks
            .iter()
            .map(|t| match t.address {
                TaskAddress::Rows(n) => n,
                TaskAddress::Blob { .. } => 1,
            })
            .sum()
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    /// Task at position `task_id` of the delivery order.
    pub fn permuted(&self, task_id: usize) -> Option<&Task> {
        self.permutation
            .get(task_id)
            .and_then(|&i| self.tasks.get(i))
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }

    pub fn permutation_mut(&mut self) -> &mut Vec<usize> {
        &mut self.permutation
    }

    /// Reset the permutation to identity.
    pub fn make_perm(&mut self) {
        self.permutation = (0..self.tasks.len()).collect();
    }

    /// Interleave per-category task lists round-robin, so balanced
    /// sampling alternates categories for as long as each still has
    /// tasks left.
    pub fn combine(lists: Vec<TaskList>) -> TaskList {
        let mut combined = TaskList::new();
        let rounds = lists.iter().map(TaskList::len).max().unwrap_or(0);
        for round in 0..rounds {
            for list in &lists {
                if let Some(task) = list.get(round) {
                    combined.tasks.push(task.clone());
                }
            }
        }
        combined
    }
}
