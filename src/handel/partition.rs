/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Partitioning of a session's replica ordering into levels.
//!
//! The ordering is treated as the leaves of a complete binary tree of depth [`max_level`]. The peers a
//! replica aggregates with at level `l` are the leaves of the sibling of its ancestor at height `l - 1`:
//! level 1 is the replica's immediate sibling, and level `max_level` is the half of the ordering that
//! does not contain the replica. Across levels `1..=max_level` these ranges are disjoint, and together
//! with the replica itself they cover the whole ordering.

use crate::types::data_types::ReplicaID;

/// Closed range `[min, max]` of indices into a session's ordering.
///
/// The range is empty when `min > max`. This happens at levels whose subtree is missing because the
/// number of replicas is not a power of two.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PeerRange {
    pub min: usize,
    pub max: usize,
}

impl PeerRange {
    /// Get the number of indices in the range.
    pub fn len(&self) -> usize {
        if self.min > self.max {
            0
        } else {
            self.max - self.min + 1
        }
    }

    /// Check whether the range contains no index.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether `index` lies within the range.
    pub fn contains(&self, index: usize) -> bool {
        self.min <= index && index <= self.max
    }

    /// Split the range at the midpoint that [`range_level`] bisects at, giving the two subtrees one level
    /// down. The upper half is empty for ranges of fewer than two indices.
    pub fn halves(&self) -> (PeerRange, PeerRange) {
        let mid = (self.min + self.max) / 2;
        (
            PeerRange {
                min: self.min,
                max: mid,
            },
            PeerRange {
                min: mid + 1,
                max: self.max,
            },
        )
    }

    /// Iterate through the indices of the range in ascending order.
    pub fn indices(&self) -> std::ops::RangeInclusive<usize> {
        self.min..=self.max
    }
}

/// Compute the number of levels of the aggregation tree over `n` replicas, i.e., `ceil(log2(n))`.
pub fn max_level(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Compute the range of indices into `ordered_ids` that holds the peers `self_id` aggregates with at
/// `level`.
///
/// Starting from the full range, the range is bisected once per level from [`max_level`] down to
/// `level`. Above the target level the half containing `self_id` is kept; at the target level the half
/// not containing it is returned. Level 0 is `self_id` alone.
pub fn range_level(
    ordered_ids: &[ReplicaID],
    self_id: ReplicaID,
    level: u32,
) -> Result<PeerRange, PartitionError> {
    let self_index = ordered_ids
        .iter()
        .position(|id| *id == self_id)
        .ok_or(PartitionError::SelfNotFound { id: self_id })?;

    let max_level = max_level(ordered_ids.len());
    if level > max_level {
        return Err(PartitionError::InvalidLevel { level, max_level });
    }
    if level == 0 {
        return Ok(PeerRange {
            min: self_index,
            max: self_index,
        });
    }

    let mut range = PeerRange {
        min: 0,
        max: ordered_ids.len() - 1,
    };
    for cur_level in (level..=max_level).rev() {
        let (lower, upper) = range.halves();
        let self_in_upper_half = upper.contains(self_index);
        range = if cur_level == level {
            // At the target level we want the half not containing self.
            if self_in_upper_half {
                lower
            } else {
                upper
            }
        } else if self_in_upper_half {
            upper
        } else {
            lower
        };
    }

    Ok(range)
}

/// The different ways a call to [`range_level`] can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum PartitionError {
    /// The requested level lies outside `[0, max_level]`.
    InvalidLevel { level: u32, max_level: u32 },

    /// The replica whose levels were requested is not part of the ordering.
    SelfNotFound { id: ReplicaID },
}

#[test]
fn max_level_test() {
    let expected = [(1, 0), (2, 1), (3, 2), (4, 2), (5, 3), (8, 3), (9, 4), (1024, 10)];
    for (n, levels) in expected {
        assert_eq!(max_level(n), levels, "n = {}", n);
    }
}

/// Tests that for every replica, levels `1..=max_level` partition the ordering minus the replica itself.
#[test]
fn range_level_partitions_ordering_test() {
    for n in 1..=33usize {
        let ids: Vec<ReplicaID> = (0..n as u32).map(|i| ReplicaID::new(i * 7 + 3)).collect();
        for (self_index, self_id) in ids.iter().enumerate() {
            let mut covered = vec![0usize; n];
            covered[self_index] += 1;

            for level in 1..=max_level(n) {
                let range = range_level(&ids, *self_id, level).unwrap();
                assert!(!range.contains(self_index));
                for index in range.indices() {
                    covered[index] += 1;
                }
            }

            assert!(
                covered.iter().all(|count| *count == 1),
                "n = {}, self = {}: {:?}",
                n,
                self_index,
                covered
            );
        }
    }
}

#[test]
fn range_level_four_replicas_test() {
    let ids: Vec<ReplicaID> = (1..=4).map(ReplicaID::new).collect();

    assert_eq!(
        range_level(&ids, ReplicaID::new(1), 1),
        Ok(PeerRange { min: 1, max: 1 })
    );
    assert_eq!(
        range_level(&ids, ReplicaID::new(1), 2),
        Ok(PeerRange { min: 2, max: 3 })
    );
    assert_eq!(
        range_level(&ids, ReplicaID::new(4), 2),
        Ok(PeerRange { min: 0, max: 1 })
    );
    assert_eq!(
        range_level(&ids, ReplicaID::new(1), 0),
        Ok(PeerRange { min: 0, max: 0 })
    );
    assert_eq!(
        range_level(&ids, ReplicaID::new(1), 3),
        Err(PartitionError::InvalidLevel {
            level: 3,
            max_level: 2
        })
    );
    assert_eq!(
        range_level(&ids, ReplicaID::new(9), 1),
        Err(PartitionError::SelfNotFound {
            id: ReplicaID::new(9)
        })
    );
}
