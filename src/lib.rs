/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Handel-style signature aggregation for HotStuff replicas.
//!
//! A HotStuff replica that has produced its own partial signature over a block hash needs to end up
//! holding an aggregate signature over the same hash that covers a quorum of the replica set. Collecting
//! those signatures all-to-all costs O(n²) verifications. This crate instead implements the Handel
//! protocol: replicas are arranged into a binary tree of [levels](handel::partition), aggregate with the
//! peers of one level at a time, and [prioritize](handel::priority) both which incoming contributions they
//! verify and which peers they contact, so that every correct replica reaches a quorum aggregate in
//! O(log n) rounds.
//!
//! ## Components
//!
//! - [`handel`]: the aggregation protocol proper: partitioning, priorities, per-level state, and the
//!   per-hash [`Session`](handel::session::Session).
//! - [`aggregator`]: the builder-pattern interface to configure and [start](aggregator::AggregatorSpec::start)
//!   an [`Aggregator`](aggregator::Aggregator), which keeps the poller, verification workers, disseminator,
//!   and event bus threads alive.
//! - [`networking`]: the pluggable [`Network`](networking::network::Network) trait and the wire
//!   [`Message`](networking::messages::Message)s.
//! - [`types`]: replica identities, hashes, coverage bitmasks, the replica directory, and the
//!   [`AggregationScheme`](types::crypto_primitives::AggregationScheme) capability with its BLS
//!   implementation.
//! - [`events`]: events emitted by the aggregator, which can be handled by user-registered closures and
//!   are [logged](logging) if enabled.

pub mod aggregator;

pub mod events;

pub(crate) mod event_bus;

pub mod handel;

pub(crate) mod logging;

pub mod networking;

pub mod types;
