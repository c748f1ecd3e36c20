/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events emitted by the aggregator, for event handling and logging.
//!
//! Note: an event for a given action indicates that the action has been completed.
//!
//! Handlers for these events are registered through the optional `on_*` setters of
//! [`AggregatorSpec`](crate::aggregator::AggregatorSpec), and run on the event bus thread. If
//! [`log_events`](crate::aggregator::Configuration::log_events) is set, every event is also
//! [logged](crate::logging).

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::handel::types::{QuorumAggregate, ReceiveOutcome};
use crate::types::data_types::{CryptoHash, ReplicaID};

pub enum Event {
    // Session lifecycle events.
    StartSession(StartSessionEvent),
    Finalize(FinalizeEvent),
    EvictSession(EvictSessionEvent),
    // Events that involve sending a contribution.
    Contribute(ContributeEvent),
    // Events that involve receiving and verifying contributions.
    ReceiveContribution(ReceiveContributionEvent),
    RejectContribution(RejectContributionEvent),
    CompleteLevel(CompleteLevelEvent),
}

impl Event {
    /// Send `event` to the event bus, if there is one. Events published while the event bus is shutting
    /// down are dropped.
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(event);
        }
    }
}

/// A session was created, either by the local replica beginning aggregation or by the first contribution
/// received for its hash.
pub struct StartSessionEvent {
    pub timestamp: SystemTime,
    pub hash: CryptoHash,
    pub max_level: u32,
}

/// A session's coverage reached a quorum.
pub struct FinalizeEvent {
    pub timestamp: SystemTime,
    pub aggregate: QuorumAggregate,
}

/// A session was removed after being inactive for the configured session timeout.
pub struct EvictSessionEvent {
    pub timestamp: SystemTime,
    pub hash: CryptoHash,
    pub finalized: bool,
}

/// The local replica sent its outgoing aggregate for `level` to `peer`.
pub struct ContributeEvent {
    pub timestamp: SystemTime,
    pub peer: ReplicaID,
    pub hash: CryptoHash,
    pub level: u32,
    pub coverage: usize,
}

pub struct ReceiveContributionEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub hash: CryptoHash,
    pub level: u32,
    pub outcome: ReceiveOutcome,
}

/// A contribution failed verification.
pub struct RejectContributionEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub hash: CryptoHash,
    pub level: u32,
}

/// The incoming aggregate of `level` came to cover every peer of the level.
pub struct CompleteLevelEvent {
    pub timestamp: SystemTime,
    pub hash: CryptoHash,
    pub level: u32,
}
