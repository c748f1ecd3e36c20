/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replica directory: the identities and keys of every replica taking part in aggregation.

use std::{collections::HashMap, slice};

use ed25519_dalek::VerifyingKey;

use super::data_types::{PublicKeyBytes, ReplicaID};

/// Identity and keys of a single replica.
#[derive(Clone, PartialEq, Debug)]
pub struct ReplicaInfo {
    /// The replica's identity within the aggregation protocol.
    pub id: ReplicaID,

    /// The key with which the [network](crate::networking::network::Network) authenticates messages
    /// from this replica.
    pub verifying_key: VerifyingKey,

    /// The key against which this replica's partial signatures verify under the
    /// [`AggregationScheme`](super::crypto_primitives::AggregationScheme).
    pub public_key: PublicKeyBytes,
}

/// Stores the identities and keys of all replicas.
///
/// ## Ordering of replicas
///
/// `ReplicaSet` internally maintains the list of replicas in ascending order of their [`ReplicaID`]s,
/// and [`iter`](Self::iter) and [`ids`](Self::ids) walk through them in this order. Sessions start from
/// this order before shuffling it.
///
/// ## Lifetime
///
/// The replica set is read-only once it has been handed to an
/// [`AggregatorSpec`](crate::aggregator::AggregatorSpec), and is shared between threads without locking.
#[derive(Clone, Default)]
pub struct ReplicaSet {
    // Replicas are included here in ascending order of their IDs.
    replicas: Vec<ReplicaInfo>,
    positions: HashMap<VerifyingKey, ReplicaID>,
}

impl ReplicaSet {
    /// Create an empty replica set.
    pub fn new() -> ReplicaSet {
        Self {
            replicas: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Put `replica` into the replica set, placing it in a position that preserves the
    /// [ordering of replicas](Self#ordering-of-replicas).
    ///
    /// If a replica with the same ID already exists in the replica set, its keys are replaced instead.
    pub fn put(&mut self, replica: ReplicaInfo) {
        match self.replicas.binary_search_by(|r| r.id.cmp(&replica.id)) {
            Ok(pos) => {
                let replaced = std::mem::replace(&mut self.replicas[pos], replica.clone());
                self.positions.remove(&replaced.verifying_key);
            }
            Err(pos) => self.replicas.insert(pos, replica.clone()),
        }
        self.positions.insert(replica.verifying_key, replica.id);
    }

    /// Remove the replica identified by `id`, returning its info if it was in the replica set.
    pub fn remove(&mut self, id: ReplicaID) -> Option<ReplicaInfo> {
        let pos = self.replicas.binary_search_by(|r| r.id.cmp(&id)).ok()?;
        let removed = self.replicas.remove(pos);
        self.positions.remove(&removed.verifying_key);
        Some(removed)
    }

    /// Get the info of the replica identified by `id`.
    pub fn get(&self, id: ReplicaID) -> Option<&ReplicaInfo> {
        self.replicas
            .binary_search_by(|r| r.id.cmp(&id))
            .ok()
            .map(|pos| &self.replicas[pos])
    }

    /// Get the ID of the replica whose transport identity is `verifying_key`.
    pub fn id_of(&self, verifying_key: &VerifyingKey) -> Option<ReplicaID> {
        self.positions.get(verifying_key).copied()
    }

    /// Check whether the replica set contains a replica identified by `id`.
    pub fn contains(&self, id: ReplicaID) -> bool {
        self.get(id).is_some()
    }

    /// Get an iterator through the replicas which walks through them in ascending order of ID.
    pub fn iter(&self) -> slice::Iter<ReplicaInfo> {
        self.replicas.iter()
    }

    /// Get the IDs of all replicas in ascending order.
    pub fn ids(&self) -> Vec<ReplicaID> {
        self.replicas.iter().map(|r| r.id).collect()
    }

    /// Get the number of replicas in the replica set.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Check whether the replica set is empty (i.e., `self.len() == 0`).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check whether two replicas share the same verifying key, which would make the origin of
    /// network messages ambiguous.
    pub(crate) fn has_shared_verifying_keys(&self) -> bool {
        self.positions.len() != self.replicas.len()
    }

    /// Compute the number of signers that an aggregate must cover in order to count as a quorum.
    pub fn quorum_size(&self) -> usize {
        self.len() * 2 / 3 + 1
    }
}
