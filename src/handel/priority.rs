/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Priority functions that order verification work and dissemination work within a level.
//!
//! ## Verification priority
//!
//! When several contributions are pending at a level, a replica verifies the one from the peer it
//! ranks highest first. The ranking is a pseudorandom permutation of `[0, n-2]` drawn from a generator
//! seeded with `seed + level`, assigned to every replica other than the ranking replica in ordering
//! order. Every correct replica computes exactly the same ranks for a given ranking replica.
//!
//! ## Contribution priority
//!
//! A replica contacts peers in the order in which those peers would verify it: its contribution
//! priority towards peer `p` is `p`'s verification priority for it. Replicas that share the same seed
//! therefore agree on who should talk to whom first, which avoids everybody sending to, and verifying
//! from, the same few peers.

use std::collections::HashMap;

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::types::data_types::ReplicaID;

/// Shuffle `[0, peers)` with a generator keyed by `(seed, level)`.
fn shuffled_ranks(peers: usize, seed: u64, level: u32) -> Vec<usize> {
    let mut ranks: Vec<usize> = (0..peers).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(level as u64));
    ranks.shuffle(&mut rng);
    ranks
}

/// Compute how `self_id` ranks every other replica in `ordered_ids` at `level`. Rank 0 is verified first.
///
/// # Precondition
///
/// `self_id` appears in `ordered_ids` exactly once.
pub fn verification_priority(
    ordered_ids: &[ReplicaID],
    seed: u64,
    self_id: ReplicaID,
    level: u32,
) -> HashMap<ReplicaID, usize> {
    let ranks = shuffled_ranks(ordered_ids.len().saturating_sub(1), seed, level);
    ordered_ids
        .iter()
        .filter(|id| **id != self_id)
        .zip(ranks)
        .map(|(id, rank)| (*id, rank))
        .collect()
}

/// Compute, for every other replica `p` in `ordered_ids`, how `p` ranks `self_id` at `level`.
///
/// # Precondition
///
/// `self_id` appears in `ordered_ids` exactly once.
pub fn contribution_priority(
    ordered_ids: &[ReplicaID],
    seed: u64,
    self_id: ReplicaID,
    level: u32,
) -> HashMap<ReplicaID, usize> {
    let Some(self_index) = ordered_ids.iter().position(|id| *id == self_id) else {
        return HashMap::new();
    };

    // The shuffled ranks do not depend on who is ranking, only the assignment does: peer `p` hands out
    // ranks in ordering order while skipping itself, so `self_id` gets the rank at its own index, minus
    // one if `p` comes before it.
    let ranks = shuffled_ranks(ordered_ids.len() - 1, seed, level);
    ordered_ids
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != self_index)
        .map(|(peer_index, peer)| {
            let self_position = if peer_index < self_index {
                self_index - 1
            } else {
                self_index
            };
            (*peer, ranks[self_position])
        })
        .collect()
}

#[test]
fn verification_priority_is_deterministic_bijection_test() {
    let ids: Vec<ReplicaID> = (0..13).map(|i| ReplicaID::new(i * 3)).collect();
    let me = ids[5];

    for level in 0..5 {
        let priorities = verification_priority(&ids, 0xdead_beef, me, level);
        assert_eq!(priorities, verification_priority(&ids, 0xdead_beef, me, level));
        assert!(!priorities.contains_key(&me));

        let mut ranks: Vec<usize> = priorities.values().copied().collect();
        ranks.sort();
        assert_eq!(ranks, (0..ids.len() - 1).collect::<Vec<_>>());
    }
}

#[test]
fn contribution_priority_is_dual_of_verification_priority_test() {
    let ids: Vec<ReplicaID> = [9, 2, 17, 4, 11, 1, 6].map(ReplicaID::new).to_vec();

    for level in 1..=3 {
        for me in &ids {
            let contribution = contribution_priority(&ids, 42, *me, level);
            assert_eq!(contribution.len(), ids.len() - 1);
            for peer in ids.iter().filter(|id| *id != me) {
                let peer_verification = verification_priority(&ids, 42, *peer, level);
                assert_eq!(contribution[peer], peer_verification[me]);
            }
        }
    }
}
