//! Task planning
//!
//! Three strategies build the task list: one task per BLOB page in block
//! mode, per-category row tasks interleaved for balanced sampling when a
//! category operator is present, and otherwise one row task per logical
//! row enumerated from every shard in parallel. Afterwards every operator
//! that is neither a category nor a shuffle-under-block-mode mutates the
//! list in declaration order, and the permutation is finalised.

use super::labels::LabelResolver;
use super::MAX_SHARD_COUNT;
use crate::format::ShardHeader;
use crate::operator::Operator;
use crate::task::{TaskAddress, TaskList};
use crate::{MindRecordError, Result};
use serde_json::Value;

/// One BLOB page worth of rows, keyed for planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowGroupSummary {
    pub shard_id: usize,
    pub group_id: u64,
    pub start_row_id: u64,
    pub row_count: u64,
}

/// Enumerate every BLOB page of the dataset.
pub(crate) fn read_row_group_summary(header: &ShardHeader) -> Result<Vec<RowGroupSummary>> {
    let shard_count = header.shard_count();
    if shard_count > MAX_SHARD_COUNT {
        return Err(MindRecordError::CapacityExceeded(format!(
            "dataset has {} shards, limit is {}",
            shard_count, MAX_SHARD_COUNT
        )));
    }
    let mut summary = Vec::new();
    for shard_id in 0..shard_count {
        let Some(last_page_id) = header.last_page_id(shard_id) else {
            continue;
        };
        for page_id in 0..=last_page_id {
            let page = header.page(shard_id, page_id)?;
            if !page.is_blob() {
                continue;
            }
            let row_count = page.row_count().ok_or_else(|| {
                MindRecordError::FormatMismatch(format!(
                    "page {} of shard {} records an inverted row range",
                    page_id, shard_id
                ))
            })?;
            summary.push(RowGroupSummary {
                shard_id,
                group_id: page.page_type_id,
                start_row_id: page.start_row_id,
                row_count,
            });
        }
    }
    // task ordering depends only on inputs and operator declarations
    summary.sort_by_key(|rg| (rg.group_id, rg.shard_id));
    Ok(summary)
}

/// Build the task list for the chosen mode and run the remaining
/// operators over it.
pub(crate) fn plan_tasks(
    summary: &[RowGroupSummary],
    resolver: &LabelResolver,
    operators: &mut [Operator],
    block_reader: bool,
) -> Result<TaskList> {
    let mut tasks = if block_reader {
        tasks_by_block(summary)
    } else if let Some(categories) = operators.iter().find_map(Operator::categories) {
        tasks_by_category(summary, resolver, categories)?
    } else {
        tasks_by_row(resolver)?
    };

    for op in operators.iter_mut() {
        if op.is_category() {
            continue;
        }
        if block_reader && op.is_shuffle() {
            continue;
        }
        op.apply(&mut tasks)?;
    }

    if tasks.permutation().is_empty() {
        tasks.make_perm();
    }
    Ok(tasks)
}

/// P1: one task per BLOB page carrying its row count.
fn tasks_by_block(summary: &[RowGroupSummary]) -> TaskList {
    let mut tasks = TaskList::new();
    for rg in summary {
        tasks.insert(
            rg.shard_id,
            rg.group_id,
            TaskAddress::Rows(rg.row_count),
            Value::Null,
        );
    }
    tasks
}

/// P2: per-category row tasks, interleaved across categories.
fn tasks_by_category(
    summary: &[RowGroupSummary],
    resolver: &LabelResolver,
    categories: &[(String, String)],
) -> Result<TaskList> {
    let mut category_tasks = Vec::with_capacity(categories.len());
    for category in categories {
        let mut tasks = TaskList::new();
        for rg in summary {
            let brief = resolver.row_group_criteria(rg.group_id, rg.shard_id, category)?;
            for ((start, end), labels) in brief.offsets.into_iter().zip(brief.labels) {
                tasks.insert(
                    rg.shard_id,
                    rg.group_id,
                    TaskAddress::Blob { start, end },
                    labels,
                );
            }
        }
        log::info!(
            "category {}={} has {} tasks",
            category.0,
            category.1,
            tasks.len()
        );
        category_tasks.push(tasks);
    }
    Ok(TaskList::combine(category_tasks))
}

/// P3 (default): one row task per logical row, enumerated from every
/// shard in parallel.
fn tasks_by_row(resolver: &LabelResolver) -> Result<TaskList> {
    let per_shard = resolver.read_all_row_groups()?;
    let mut tasks = TaskList::new();
    for (shard_id, (metas, labels)) in per_shard.into_iter().enumerate() {
        for (meta, labels) in metas.into_iter().zip(labels) {
            tasks.insert(
                shard_id,
                meta.group_id,
                TaskAddress::Blob {
                    start: meta.start,
                    end: meta.end,
                },
                labels,
            );
        }
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_by_block() {
        let summary = vec![
            RowGroupSummary {
                shard_id: 0,
                group_id: 0,
                start_row_id: 0,
                row_count: 3,
            },
            RowGroupSummary {
                shard_id: 1,
                group_id: 0,
                start_row_id: 0,
                row_count: 2,
            },
        ];
        let tasks = tasks_by_block(&summary);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks.size_of_rows(), 5);
        assert!(matches!(
            tasks.get(0).unwrap().address,
            TaskAddress::Rows(3)
        ));
    }
}
