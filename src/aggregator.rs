/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run an aggregator.
//!
//! An aggregator runs Handel signature aggregation on behalf of one replica. The consensus layer hands it
//! the replica's own partial signature over a hash through [`Aggregator::begin`], and eventually receives
//! an aggregate signature over the same hash that covers a quorum of the replica set, either through the
//! `on_finalize` handler or by polling [`Aggregator::aggregate`].
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the aggregator](AggregatorSpec) with:
//!   1. `AggregatorSpec::builder` to construct an `AggregatorSpecBuilder`,
//!   2. The setters of the `AggregatorSpecBuilder`, and
//!   3. The `AggregatorSpecBuilder::build` method to construct an [AggregatorSpec],
//! - The function to [start](AggregatorSpec::start) an [Aggregator] given its specification,
//! - [The type](Aggregator) which keeps the aggregator's threads alive.
//!
//! ## Starting an aggregator
//!
//! ```ignore
//! let aggregator =
//!     AggregatorSpec::builder()
//!     .replica_set(replica_set)
//!     .scheme(Bls)
//!     .network(network)
//!     .configuration(configuration)
//!     .on_finalize(finalize_handler)
//!     .build()
//!     .start()?;
//!
//! aggregator.begin(block_hash, keypair.sign(&block_hash.bytes()));
//! ```
//!
//! ### Required setters
//!
//! - `.replica_set(...)`
//! - `.scheme(...)`
//! - `.network(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for events from [crate::events]:
//! - `.on_start_session(...)`
//! - `.on_finalize(...)`
//! - `.on_evict_session(...)`
//! - `.on_contribute(...)`
//! - `.on_receive_contribution(...)`
//! - `.on_reject_contribution(...)`
//! - `.on_complete_level(...)`
//!
//! ## Threads
//!
//! A running aggregator keeps the following threads alive:
//! 1. The poller, which receives messages from the [`Network`] and scores and queues the contributions
//!    they carry.
//! 2. `verification_workers` verification workers, which verify queued contributions and merge them.
//! 3. The disseminator, which periodically sends contributions to peers, escalates stalled levels, and
//!    evicts inactive sessions.
//! 4. The event bus, if any handler is registered or `log_events` is set.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::event_bus::*;
use crate::events::*;
use crate::handel::coordinator::{start_disseminator, start_verification_worker, Handel};
use crate::handel::partition;
use crate::handel::session::SessionConfiguration;
use crate::handel::types::QuorumAggregate;
use crate::networking::network::Network;
use crate::networking::receiving::start_polling;
use crate::types::crypto_primitives::AggregationScheme;
use crate::types::data_types::{CryptoHash, ReplicaID, SignatureBytes};
use crate::types::replica_set::ReplicaSet;

/// Stores the user-defined parameters required to start the aggregator.
///
/// ## Windows
///
/// Each level of a session limits how many of its peers it contacts at once to its *window*. The window
/// starts at `initial_window`, is multiplied by `window_growth_factor` (up to `max_window`) whenever the
/// level merges a contribution or stalls, and is divided by `window_shrink_factor` (down to 1) whenever a
/// contribution at the level fails verification.
///
/// ## Level timeout
///
/// Level `l` of a session starts disseminating `(l - 1) * level_timeout` after the session is created, or
/// as soon as every level below it is complete, whichever comes first. A level that makes no progress for
/// `level_timeout` is considered stalled.
///
/// ## Shared random seed
///
/// The shuffled ordering of replicas in each session, and hence the shape of the aggregation tree, is
/// derived from the hash being aggregated and `shared_random_seed`. All replicas must use the same
/// `shared_random_seed`.
///
/// ## Log Events
///
/// The aggregator logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder, Clone, Debug)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`

    Optional:
    - `.shared_random_seed(...)`
    - `.initial_window(...)`
    - `.max_window(...)`
    - `.window_growth_factor(...)`
    - `.window_shrink_factor(...)`
    - `.level_timeout(...)`
    - `.dissemination_period(...)`
    - `.session_timeout(...)`
    - `.pending_capacity(...)`
    - `.verification_workers(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the ID of the local replica in the replica set. Required."))]
    pub me: ReplicaID,
    #[builder(
        default = 0,
        setter(doc = "Set the random seed shared by all replicas. Defaults to 0.")
    )]
    pub shared_random_seed: u64,
    #[builder(
        default = 1,
        setter(doc = "Set the number of peers a level contacts at once when it starts. Defaults to 1.")
    )]
    pub initial_window: usize,
    #[builder(
        default = 16,
        setter(doc = "Set the maximum number of peers a level contacts at once. Defaults to 16.")
    )]
    pub max_window: usize,
    #[builder(
        default = 2,
        setter(doc = "Set the factor by which a level's window grows on progress. Defaults to 2.")
    )]
    pub window_growth_factor: usize,
    #[builder(
        default = 4,
        setter(doc = "Set the factor by which a level's window shrinks on a verification failure. Defaults to 4.")
    )]
    pub window_shrink_factor: usize,
    #[builder(
        default = Duration::from_millis(50),
        setter(doc = "Set the time after which the next level starts, and after which a level without progress is considered stalled. Defaults to 50ms.")
    )]
    pub level_timeout: Duration,
    #[builder(
        default = Duration::from_millis(10),
        setter(doc = "Set the period of the disseminator thread. Defaults to 10ms.")
    )]
    pub dissemination_period: Duration,
    #[builder(
        default = Duration::from_secs(60),
        setter(doc = "Set how long a session may be inactive before it is evicted. Defaults to 60s.")
    )]
    pub session_timeout: Duration,
    #[builder(
        default = 16,
        setter(doc = "Set the maximum number of unverified contributions buffered per level. Defaults to 16.")
    )]
    pub pending_capacity: usize,
    #[builder(
        default = 2,
        setter(doc = "Set the number of verification worker threads. Defaults to 2.")
    )]
    pub verification_workers: usize,
    #[builder(default = false, setter(doc = "Enable logging? Defaults to false."))]
    pub log_events: bool,
}

impl Configuration {
    fn validate(&self) -> Result<(), AggregatorError> {
        let invalid = |field: &'static str| Err(AggregatorError::InvalidConfiguration { field });
        if self.initial_window == 0 {
            return invalid("initial_window");
        }
        if self.max_window < self.initial_window {
            return invalid("max_window");
        }
        if self.window_growth_factor == 0 {
            return invalid("window_growth_factor");
        }
        if self.window_shrink_factor == 0 {
            return invalid("window_shrink_factor");
        }
        if self.dissemination_period.is_zero() {
            return invalid("dissemination_period");
        }
        if self.pending_capacity == 0 {
            return invalid("pending_capacity");
        }
        if self.verification_workers == 0 {
            return invalid("verification_workers");
        }
        Ok(())
    }
}

impl From<&Configuration> for SessionConfiguration {
    fn from(config: &Configuration) -> Self {
        SessionConfiguration {
            shared_random_seed: config.shared_random_seed,
            initial_window: config.initial_window,
            max_window: config.max_window,
            window_growth_factor: config.window_growth_factor,
            window_shrink_factor: config.window_shrink_factor,
            level_timeout: config.level_timeout,
            pending_capacity: config.pending_capacity,
        }
    }
}

/// Stores all necessary parameters and trait implementations required to run the [Aggregator].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building an [AggregatorSpec]. On the builder call the following methods to construct a valid [AggregatorSpec].

    Required:
    - `.replica_set(...)`
    - `.scheme(...)`
    - `.network(...)`
    - `.configuration(...)`

    Optional:
    - `.on_start_session(...)`
    - `.on_finalize(...)`
    - `.on_evict_session(...)`
    - `.on_contribute(...)`
    - `.on_receive_contribution(...)`
    - `.on_reject_contribution(...)`
    - `.on_complete_level(...)`
"))]
pub struct AggregatorSpec<N: Network + 'static, S: AggregationScheme> {
    // Required parameters
    #[builder(setter(doc = "Set the [replica set](crate::types::replica_set::ReplicaSet), which must contain the local replica. Required."))]
    replica_set: ReplicaSet,
    #[builder(setter(doc = "Set the [aggregation scheme](crate::types::crypto_primitives::AggregationScheme) used to verify and combine signatures. Required."))]
    scheme: S,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run an aggregator. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&StartSessionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartSessionEvent>),
    doc = "Register a handler closure to be invoked after a session is created. Optional."))]
    on_start_session: Option<HandlerPtr<StartSessionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FinalizeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FinalizeEvent>),
    doc = "Register a handler closure to be invoked after a session finalizes a quorum aggregate. Optional."))]
    on_finalize: Option<HandlerPtr<FinalizeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EvictSessionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EvictSessionEvent>),
    doc = "Register a handler closure to be invoked after an inactive session is evicted. Optional."))]
    on_evict_session: Option<HandlerPtr<EvictSessionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ContributeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ContributeEvent>),
    doc = "Register a handler closure to be invoked after the aggregator sends a contribution to a peer. Optional."))]
    on_contribute: Option<HandlerPtr<ContributeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveContributionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveContributionEvent>),
    doc = "Register a handler closure to be invoked after the aggregator receives a contribution from a peer. Optional."))]
    on_receive_contribution: Option<HandlerPtr<ReceiveContributionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RejectContributionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RejectContributionEvent>),
    doc = "Register a handler closure to be invoked after a contribution fails verification. Optional."))]
    on_reject_contribution: Option<HandlerPtr<RejectContributionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CompleteLevelEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CompleteLevelEvent>),
    doc = "Register a handler closure to be invoked after a level of a session becomes complete. Optional."))]
    on_complete_level: Option<HandlerPtr<CompleteLevelEvent>>,
}

impl<N: Network + 'static, S: AggregationScheme> AggregatorSpec<N, S> {
    /// Starts all threads and channels associated with running an aggregator, and returns the handles to
    /// them in an [Aggregator] struct.
    ///
    /// Fails without starting any thread if the replica set or the configuration is unusable.
    pub fn start(mut self) -> Result<Aggregator<N, S>, AggregatorError> {
        let me = self.configuration.me;
        if self.replica_set.is_empty() {
            return Err(AggregatorError::EmptyReplicaSet);
        }
        if !self.replica_set.contains(me) {
            return Err(AggregatorError::MissingSelf { id: me });
        }
        if self.replica_set.has_shared_verifying_keys() {
            return Err(AggregatorError::DuplicateReplica);
        }
        self.configuration.validate()?;

        log::debug!(
            "Starting aggregator for replica {} in a replica set of {}, max level {}",
            me,
            self.replica_set.len(),
            partition::max_level(self.replica_set.len())
        );
        self.network.init_replica_set(self.replica_set.clone());
        let replica_set = Arc::new(self.replica_set);

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_start_session,
            self.on_finalize,
            self.on_evict_session,
            self.on_contribute,
            self.on_receive_contribution,
            self.on_reject_contribution,
            self.on_complete_level,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (verification_queue, verification_jobs) = mpsc::channel();
        let handel = Handel::new(
            me,
            replica_set,
            Arc::new(self.scheme),
            SessionConfiguration::from(&self.configuration),
            self.configuration.session_timeout,
            self.network.clone(),
            verification_queue,
            event_publisher,
        );

        let (event_bus_shutdown, event_bus) = match event_subscriber {
            Some(event_subscriber) => {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                let event_bus = start_event_bus(event_handlers, event_subscriber, shutdown_receiver);
                (Some(shutdown), Some(event_bus))
            }
            None => (None, None),
        };

        let verification_jobs = Arc::new(Mutex::new(verification_jobs));
        let mut verification_workers = Vec::with_capacity(self.configuration.verification_workers);
        for _ in 0..self.configuration.verification_workers {
            let (shutdown, shutdown_receiver) = mpsc::channel();
            let worker = start_verification_worker(
                handel.clone(),
                verification_jobs.clone(),
                shutdown_receiver,
            );
            verification_workers.push((shutdown, Some(worker)));
        }

        let (disseminator_shutdown, disseminator_shutdown_receiver) = mpsc::channel();
        let disseminator = start_disseminator(
            handel.clone(),
            self.configuration.dissemination_period,
            disseminator_shutdown_receiver,
        );

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller_handel = handel.clone();
        let poller = start_polling(
            self.network,
            move |origin, msg| poller_handel.on_message(&origin, msg),
            poller_shutdown_receiver,
        );

        Ok(Aggregator {
            handel,
            poller: Some(poller),
            poller_shutdown,
            disseminator: Some(disseminator),
            disseminator_shutdown,
            verification_workers,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of an aggregator. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Aggregator<N: Network + 'static, S: AggregationScheme> {
    handel: Handel<N, S>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    disseminator: Option<JoinHandle<()>>,
    disseminator_shutdown: Sender<()>,
    verification_workers: Vec<(Sender<()>, Option<JoinHandle<()>>)>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<N: Network + 'static, S: AggregationScheme> Aggregator<N, S> {
    /// Start aggregating over `hash`, contributing the local replica's `partial_signature` over it.
    ///
    /// Returns immediately. Calling `begin` again for the same hash has no further effect.
    pub fn begin(&self, hash: CryptoHash, partial_signature: SignatureBytes) {
        self.handel.begin(hash, partial_signature)
    }

    /// Get the quorum aggregate over `hash`, if it has been finalized.
    pub fn aggregate(&self, hash: &CryptoHash) -> Option<QuorumAggregate> {
        self.handel.aggregate(hash)
    }

    /// Take the quorum aggregate over `hash`, if it has been finalized, and discard its session.
    pub fn take_aggregate(&self, hash: &CryptoHash) -> Option<QuorumAggregate> {
        self.handel.take_aggregate(hash)
    }

    /// Get the number of sessions that are currently alive.
    pub fn session_count(&self) -> usize {
        self.handel.session_count()
    }
}

impl<N: Network + 'static, S: AggregationScheme> Drop for Aggregator<N, S> {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important. The poller feeds the
        // verification workers, and every thread publishes to the event bus, so the poller goes first and the
        // event bus goes last.

        self.poller_shutdown.send(()).unwrap();
        self.poller.take().unwrap().join().unwrap();

        self.disseminator_shutdown.send(()).unwrap();
        self.disseminator.take().unwrap().join().unwrap();

        for (shutdown, worker) in self.verification_workers.iter_mut() {
            shutdown.send(()).unwrap();
            worker.take().unwrap().join().unwrap();
        }

        self.event_bus_shutdown
            .iter()
            .for_each(|shutdown| shutdown.send(()).unwrap());
        if let Some(event_bus) = self.event_bus.take() {
            event_bus.join().unwrap();
        }
    }
}

/// The different ways [`AggregatorSpec::start`] can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum AggregatorError {
    /// The replica set is empty.
    EmptyReplicaSet,

    /// The local replica, identified by [`Configuration::me`], is not in the replica set.
    MissingSelf { id: ReplicaID },

    /// Two replicas in the replica set share the same verifying key, so messages from them cannot be told
    /// apart.
    DuplicateReplica,

    /// A field of the [`Configuration`] has an unusable value.
    InvalidConfiguration { field: &'static str },
}
