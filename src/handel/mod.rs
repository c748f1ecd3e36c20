/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Handel aggregation protocol.
//!
//! ## Overview
//!
//! For each hash that the replicas sign, every replica runs a [`Session`](session::Session). The session
//! shuffles the replica set into an ordering that all correct replicas agree on, and arranges the ordering
//! as the leaves of a binary tree. At level `l`, a replica exchanges aggregates with the `2^(l-1)` replicas
//! in the sibling subtree of its height-`(l - 1)` ancestor (see [`partition`]):
//! - It *sends* them its outgoing aggregate: its own signature combined with everything it has verified at
//!   levels below `l`. This covers exactly the subtree the replica itself belongs to.
//! - It *receives* from them their outgoing aggregates, verifies them, and keeps the best one (or the
//!   combination of disjoint ones) as the level's incoming aggregate.
//!
//! Once the incoming aggregates of all levels, together with its own signature, cover a quorum, the
//! session finalizes.
//!
//! ## Prioritization
//!
//! Replicas do not verify everything they receive, nor send to every peer at once. Received contributions
//! are [scored](session::Session::score) by how much new coverage they would bring, and verified in order
//! of score, then [verification priority](priority::verification_priority). Sending is limited to a
//! window of peers per level, picked in order of [contribution priority](priority::contribution_priority),
//! which grows while the level makes progress and shrinks when peers send invalid signatures.
//!
//! ## Threads
//!
//! Sessions are plain state machines. The [`Aggregator`](crate::aggregator::Aggregator) keeps them in a
//! registry and drives them from its poller, verification worker, and disseminator threads.

pub mod partition;

pub mod priority;

pub mod types;

pub mod messages;

pub(crate) mod level;

pub mod session;

pub(crate) mod registry;

pub(crate) mod coordinator;
