/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or numbers, and do not have any major "active" behavior.

use std::fmt::{self, Debug, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

/// Number that uniquely identifies a replica in the [replica set](super::replica_set::ReplicaSet).
///
/// Replica IDs are only compared and sorted; they carry no meaning beyond identity. All replicas in a
/// deployment must agree on the mapping between `ReplicaID`s and the keys in the replica set.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, BorshSerialize, BorshDeserialize,
)]
pub struct ReplicaID(u32);

impl ReplicaID {
    /// Create a new `ReplicaID` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` value of this `ReplicaID`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for ReplicaID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 32-byte cryptographic hash.
///
/// Within the aggregator, a `CryptoHash` is the message being signed: the hash of the block (or other
/// value) that the consensus layer wants a quorum aggregate over. Each distinct `CryptoHash` gets its own
/// [`Session`](crate::handel::session::Session).
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Interpret the first eight bytes of this hash as a little-endian `u64`.
    pub fn prefix_u64(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(prefix)
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Bytes of a (possibly aggregate) signature produced by an
/// [`AggregationScheme`](super::crypto_primitives::AggregationScheme).
///
/// The aggregator never looks inside these bytes. It only hands them to the scheme to be verified or
/// combined.
#[derive(Clone, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct SignatureBytes(Vec<u8>);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the inner bytes of this `SignatureBytes`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({} bytes)", self.0.len())
    }
}

/// Bytes of a replica's aggregation public key, as understood by an
/// [`AggregationScheme`](super::crypto_primitives::AggregationScheme).
#[derive(Clone, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct PublicKeyBytes(Vec<u8>);

impl PublicKeyBytes {
    /// Create a new `PublicKeyBytes` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the inner bytes of this `PublicKeyBytes`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({} bytes)", self.0.len())
    }
}
