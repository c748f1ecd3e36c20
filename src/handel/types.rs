/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types returned by [`Session`](super::session::Session) methods.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    bitmask::Bitmask,
    data_types::{CryptoHash, ReplicaID, SignatureBytes},
};

/// A verified aggregate signature together with the signers it covers.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Aggregate {
    pub signature: SignatureBytes,
    pub bitmask: Bitmask,
}

/// The aggregate signature that a session finalizes once it covers a quorum.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub struct QuorumAggregate {
    /// The hash that `signature` is over.
    pub hash: CryptoHash,

    /// Aggregate signature over `hash` by exactly the replicas in `signers`.
    pub signature: SignatureBytes,

    /// The signers, indexed by position in the session's
    /// [ordering](super::session::Session::ordered_ids).
    pub bitmask: Bitmask,

    /// The signers, in ascending order of ID.
    pub signers: Vec<ReplicaID>,
}

/// Coverage of a level's incoming aggregate relative to the size of the level.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LevelState {
    /// No contribution has been merged at this level yet.
    Empty,

    /// Some, but not all, of the level's peers are covered.
    Partial,

    /// Every peer of the level is covered. Levels without peers are always complete.
    Complete,
}

/// What a [`Session`](super::session::Session) did with a received contribution.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReceiveOutcome {
    /// The contribution was queued for verification.
    Pending,

    /// The contribution was dropped without being verified.
    Ignored(IgnoreReason),
}

/// Why a contribution was dropped without being verified.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IgnoreReason {
    /// The session already holds a quorum aggregate.
    Finalized,

    /// The sender is not part of the replica set.
    UnknownSender,

    /// The contribution claims to come from the local replica.
    OwnContribution,

    /// The level lies outside `[1, max_level]`.
    InvalidLevel,

    /// The bitmask has the wrong length, is not well formed, is empty, or covers indices outside the
    /// level.
    MalformedBitmask,

    /// The sender is not one of the level's peers.
    SenderNotInLevel,

    /// The contribution adds no coverage that can be merged into the level's incoming aggregate.
    NoNewCoverage,

    /// An identical payload previously failed verification.
    PreviouslyRejected,

    /// A contribution from the same sender with an equal or better score is already pending.
    Superseded,

    /// The level's pending buffer is full of contributions that score at least as well.
    PendingFull,
}

/// What a [`Session`](super::session::Session) did with the result of a verification.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum VerificationOutcome {
    /// The signature did not verify. Its payload will never be verified again.
    Rejected,

    /// The signature verified, but the level's incoming aggregate moved on in the meantime and the
    /// contribution no longer adds mergeable coverage, or the session has finalized.
    Stale,

    /// The contribution was merged into the incoming aggregate of `level`.
    Merged {
        level: u32,

        /// Whether `level` became complete through this merge.
        completed: bool,

        /// The quorum aggregate, if this merge finalized the session.
        finalized: Option<QuorumAggregate>,
    },
}
