//! Process group identity.
//!
//! A [`ProcessGroup`] is produced by
//! [`Transport::join`](crate::transport::Transport::join) and threaded through
//! every protocol call as a plain value. It never changes for the lifetime of
//! a session.

use thiserror::Error;

/// Rank of the coordinator in every group.
pub const COORDINATOR: usize = 0;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupError {
    #[error("a process group must contain at least one process")]
    Empty,
    #[error("rank {rank} is out of range for a group of size {size}")]
    RankOutOfRange { rank: usize, size: usize },
}

/// This process's position within a fixed-size group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessGroup {
    rank: usize,
    size: usize,
}

impl ProcessGroup {
    pub fn new(rank: usize, size: usize) -> Result<Self, GroupError> {
        if size == 0 {
            return Err(GroupError::Empty);
        }
        if rank >= size {
            return Err(GroupError::RankOutOfRange { rank, size });
        }

        Ok(Self { rank, size })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this process is the coordinator (rank 0).
    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR
    }

    /// Ranks of every worker in the group, in ascending order.
    pub fn workers(&self) -> impl Iterator<Item = usize> {
        (COORDINATOR + 1)..self.size
    }
}

impl std::fmt::Display for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.rank, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_zero_is_coordinator() {
        assert!(ProcessGroup::new(0, 3).unwrap().is_coordinator());
        assert!(!ProcessGroup::new(2, 3).unwrap().is_coordinator());
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        assert_eq!(ProcessGroup::new(0, 0), Err(GroupError::Empty));
        assert_eq!(
            ProcessGroup::new(3, 3),
            Err(GroupError::RankOutOfRange { rank: 3, size: 3 })
        );
    }

    #[test]
    fn workers_exclude_coordinator() {
        let group = ProcessGroup::new(0, 4).unwrap();
        assert_eq!(group.workers().collect::<Vec<_>>(), vec![1, 2, 3]);
        let single = ProcessGroup::new(0, 1).unwrap();
        assert_eq!(single.workers().count(), 0);
    }
}
