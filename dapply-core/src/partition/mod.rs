//! Static task partitioning.
//!
//! Every apply round splits its `N` tasks into contiguous, rank-ordered
//! ranges: the coordinator owns the first range, rank 1 the next, and so on.
//! [`plan`] decides how many tasks each rank owns; [`Partition`] derives the
//! byte-level shape the scatter phase needs from that plan and the task
//! payload sizes.

use std::ops::Range;

use crate::{
    group::COORDINATOR,
    packing::{segment_sums, Layout, ShapeError},
};

/// Number of tasks owned by each rank of a group of `group_size` processes.
///
/// The coordinator always takes `task_count / group_size` tasks (possibly
/// zero). The remaining tasks are split evenly across the workers, with the
/// remainder handed out one extra task at a time in ascending rank order.
///
/// ```
/// use dapply::partition::plan;
///
/// assert_eq!(plan(10, 4), vec![2, 3, 3, 2]);
/// assert_eq!(plan(2, 4), vec![0, 1, 1, 0]);
/// assert_eq!(plan(7, 1), vec![7]);
/// ```
///
/// # Panics
///
/// Panics if `group_size` is zero. A [`ProcessGroup`](crate::group::ProcessGroup)
/// can never have size zero.
pub fn plan(task_count: usize, group_size: usize) -> Vec<usize> {
    assert!(group_size > 0, "cannot partition over an empty group");

    let coordinator = task_count / group_size;
    let mut counts = vec![0; group_size];
    counts[COORDINATOR] = coordinator;

    if group_size == 1 {
        counts[COORDINATOR] = task_count;
        return counts;
    }

    let remaining = task_count - coordinator;
    let workers = group_size - 1;
    let (div, rem) = (remaining / workers, remaining % workers);
    for (offset, count) in counts[1..].iter_mut().enumerate() {
        *count = if offset < rem { div + 1 } else { div };
    }

    counts
}

/// Payload bytes of each rank's contiguous run of tasks.
///
/// `counts` must not claim more tasks than `task_sizes` holds; [`plan`]
/// always sums to exactly the task count.
fn byte_counts(task_sizes: &[usize], counts: &[usize]) -> Vec<usize> {
    let mut rest = task_sizes;
    counts
        .iter()
        .map(|&count| {
            let (own, tail) = rest.split_at(count.min(rest.len()));
            rest = tail;
            own.iter().sum()
        })
        .collect()
}

/// The shape of one apply round, as seen by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Task counts per rank, with task-index displacements.
    tasks: Layout,
    /// Byte size of every task payload, in task order.
    task_sizes: Vec<usize>,
    /// Payload bytes per rank, with byte displacements.
    bytes: Layout,
}

impl Partition {
    /// Plan a round over `group_size` ranks for tasks of the given sizes.
    pub fn new(task_sizes: Vec<usize>, group_size: usize) -> Self {
        let counts = plan(task_sizes.len(), group_size);
        let byte_counts = byte_counts(&task_sizes, &counts);

        Self {
            tasks: Layout::from_counts(counts),
            task_sizes,
            bytes: Layout::from_counts(byte_counts),
        }
    }

    /// Rebuild a partition from externally supplied counts, checking that
    /// they describe exactly the given tasks.
    pub fn from_counts(counts: Vec<usize>, task_sizes: Vec<usize>) -> Result<Self, ShapeError> {
        let byte_counts = segment_sums(&task_sizes, &counts)?;
        Ok(Self {
            tasks: Layout::from_counts(counts),
            task_sizes,
            bytes: Layout::from_counts(byte_counts),
        })
    }

    pub fn task_count(&self) -> usize {
        self.task_sizes.len()
    }

    pub fn group_size(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks owned by each rank.
    pub fn counts(&self) -> &[usize] {
        self.tasks.counts()
    }

    pub fn task_layout(&self) -> &Layout {
        &self.tasks
    }

    pub fn task_sizes(&self) -> &[usize] {
        &self.task_sizes
    }

    /// Payload bytes owned by each rank.
    pub fn byte_layout(&self) -> &Layout {
        &self.bytes
    }

    /// Task indices owned by `rank`.
    pub fn task_range(&self, rank: usize) -> Result<Range<usize>, ShapeError> {
        self.tasks.range(rank)
    }
}
