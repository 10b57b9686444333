//! Row operators
//!
//! Operators transform the planned task list in place. Shuffle permutes
//! the delivery permutation; category is a marker the planner consumes to
//! build a balanced per-category plan (its `apply` is a no-op).

use crate::task::TaskList;
use crate::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Shuffles the delivery permutation. A seeded shuffle advances its seed
/// every epoch so reshuffles stay deterministic without repeating.
#[derive(Debug)]
pub struct ShuffleOp {
    seed: Option<u64>,
    epoch: u64,
}

impl ShuffleOp {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed, epoch: 0 }
    }

    fn apply(&mut self, tasks: &mut TaskList) {
        if tasks.permutation().is_empty() {
            tasks.make_perm();
        }
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(self.epoch)),
            None => StdRng::from_entropy(),
        };
        tasks.permutation_mut().shuffle(&mut rng);
        self.epoch += 1;
    }
}

/// Category-balanced sampling marker: the planner queries each
/// `(field, value)` pair per row group and interleaves the matches.
#[derive(Debug, Clone)]
pub struct CategoryOp {
    categories: Vec<(String, String)>,
}

impl CategoryOp {
    pub fn new(categories: Vec<(String, String)>) -> Self {
        Self { categories }
    }

    pub fn categories(&self) -> &[(String, String)] {
        &self.categories
    }
}

/// A user-injected task-list transformation.
#[derive(Debug)]
pub enum Operator {
    Shuffle(ShuffleOp),
    Category(CategoryOp),
}

impl Operator {
    pub fn shuffle(seed: Option<u64>) -> Self {
        Operator::Shuffle(ShuffleOp::new(seed))
    }

    pub fn category(categories: Vec<(String, String)>) -> Self {
        Operator::Category(CategoryOp::new(categories))
    }

    pub fn is_shuffle(&self) -> bool {
        matches!(self, Operator::Shuffle(_))
    }

    pub fn is_category(&self) -> bool {
        matches!(self, Operator::Category(_))
    }

    pub fn categories(&self) -> Option<&[(String, String)]> {
        match self {
            Operator::Category(op) => Some(op.categories()),
            Operator::Shuffle(_) => None,
        }
    }

    pub fn apply(&mut self, tasks: &mut TaskList) -> Result<()> {
        match self {
            Operator::Shuffle(op) => op.apply(tasks),
            // consumed by the planner, nothing left to do on the list
            Operator::Category(_) => {}
        }
        Ok(())
    }
}
