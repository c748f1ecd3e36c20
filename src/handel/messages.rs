/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged by replicas in the aggregation protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    bitmask::Bitmask,
    crypto_primitives::{CryptoHasher, Digest},
    data_types::{CryptoHash, SignatureBytes},
};

/// An aggregate signature offered by a peer for one level of the receiving replica's session.
///
/// A contribution for level `l` covers (a subset of) the peers that the *receiver* aggregates with at
/// level `l`, which is the half of the tree the *sender* belongs to.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct Contribution {
    pub level: u32,
    pub bitmask: Bitmask,
    pub signature: SignatureBytes,
}

impl Contribution {
    /// Compute a digest that identifies this exact payload, used to remember payloads that failed
    /// verification.
    pub fn digest(&self) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(self.level.to_le_bytes());
        hasher.update((self.bitmask.len() as u64).to_le_bytes());
        for index in self.bitmask.iter() {
            hasher.update((index as u64).to_le_bytes());
        }
        hasher.update(self.signature.bytes());
        CryptoHash::new(hasher.finalize().into())
    }
}

/// A [`Contribution`] together with the hash of the session it belongs to.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct ContributeMessage {
    pub hash: CryptoHash,
    pub contribution: Contribution,
}

impl ContributeMessage {
    /// Get the approximate number of bytes this message occupies.
    pub fn size(&self) -> u64 {
        (32 + 4 + 4 + self.contribution.bitmask.len().div_ceil(8)
            + self.contribution.signature.bytes().len()) as u64
    }
}
