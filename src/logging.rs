/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the aggregator's
//! [config](crate::aggregator::Configuration).
//!
//! The aggregator logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [ReceiveContribution](crate::events::ReceiveContributionEvent) is printed:
//!
//! ```text
//! ReceiveContribution, 1701329264, 3, fNGCJyk, 2, Pending
//! ```
//!
//! In the snippet:
//! - The third value is the ID of the replica the contribution came from.
//! - The fourth value is the first seven characters of the Base64 encoding of the hash being aggregated.
//! - The fifth value is the level of the contribution.
//! - The sixth value is what the session did with the contribution.

use crate::events::*;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

// Names of each event in PascalCase for printing:
pub(crate) const START_SESSION: &str = "StartSession";
pub(crate) const FINALIZE: &str = "Finalize";
pub(crate) const EVICT_SESSION: &str = "EvictSession";

pub(crate) const CONTRIBUTE: &str = "Contribute";

pub(crate) const RECEIVE_CONTRIBUTION: &str = "ReceiveContribution";
pub(crate) const REJECT_CONTRIBUTION: &str = "RejectContribution";
pub(crate) const COMPLETE_LEVEL: &str = "CompleteLevel";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for StartSessionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_session_event: &StartSessionEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_SESSION,
                secs_since_unix_epoch(start_session_event.timestamp),
                first_seven_base64_chars(&start_session_event.hash.bytes()),
                start_session_event.max_level
            )
        };
        Box::new(logger)
    }
}

impl Logger for FinalizeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |finalize_event: &FinalizeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                FINALIZE,
                secs_since_unix_epoch(finalize_event.timestamp),
                first_seven_base64_chars(&finalize_event.aggregate.hash.bytes()),
                finalize_event.aggregate.signers.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for EvictSessionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |evict_session_event: &EvictSessionEvent| {
            log::info!(
                "{}, {}, {}, {}",
                EVICT_SESSION,
                secs_since_unix_epoch(evict_session_event.timestamp),
                first_seven_base64_chars(&evict_session_event.hash.bytes()),
                evict_session_event.finalized
            )
        };
        Box::new(logger)
    }
}

impl Logger for ContributeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |contribute_event: &ContributeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                CONTRIBUTE,
                secs_since_unix_epoch(contribute_event.timestamp),
                contribute_event.peer,
                first_seven_base64_chars(&contribute_event.hash.bytes()),
                contribute_event.level,
                contribute_event.coverage
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveContributionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_contribution_event: &ReceiveContributionEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {:?}",
                RECEIVE_CONTRIBUTION,
                secs_since_unix_epoch(receive_contribution_event.timestamp),
                receive_contribution_event.origin,
                first_seven_base64_chars(&receive_contribution_event.hash.bytes()),
                receive_contribution_event.level,
                receive_contribution_event.outcome
            )
        };
        Box::new(logger)
    }
}

impl Logger for RejectContributionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reject_contribution_event: &RejectContributionEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                REJECT_CONTRIBUTION,
                secs_since_unix_epoch(reject_contribution_event.timestamp),
                reject_contribution_event.origin,
                first_seven_base64_chars(&reject_contribution_event.hash.bytes()),
                reject_contribution_event.level
            )
        };
        Box::new(logger)
    }
}

impl Logger for CompleteLevelEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |complete_level_event: &CompleteLevelEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMPLETE_LEVEL,
                secs_since_unix_epoch(complete_level_event.timestamp),
                first_seven_base64_chars(&complete_level_event.hash.bytes()),
                complete_level_event.level
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
