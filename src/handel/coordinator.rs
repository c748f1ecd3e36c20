/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Process-wide coordination of sessions: the inbound entry point, the verification workers, and the
//! periodic disseminator.
//!
//! [`Handel`] is a cheaply cloneable handle. Every thread of a running
//! [`Aggregator`](crate::aggregator::Aggregator) owns a clone of it, and all clones share the same
//! [`SessionRegistry`].

use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use ed25519_dalek::VerifyingKey;

use crate::{
    events::*,
    networking::{messages::Message, network::Network, service::ContributionService},
    types::{
        crypto_primitives::AggregationScheme,
        data_types::{CryptoHash, ReplicaID, SignatureBytes},
        replica_set::ReplicaSet,
    },
};

use super::{
    messages::{ContributeMessage, Contribution},
    registry::{SessionHandle, SessionRegistry},
    session::{short_hash, Session, SessionConfiguration},
    types::{QuorumAggregate, ReceiveOutcome, VerificationOutcome},
};

pub(crate) struct Handel<N: Network, S: AggregationScheme> {
    me: ReplicaID,
    replica_set: Arc<ReplicaSet>,
    scheme: Arc<S>,
    config: SessionConfiguration,
    session_timeout: Duration,
    registry: Arc<SessionRegistry<S>>,
    service: ContributionService<N>,
    verification_queue: Sender<CryptoHash>,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network, S: AggregationScheme> Clone for Handel<N, S> {
    fn clone(&self) -> Self {
        Self {
            me: self.me,
            replica_set: self.replica_set.clone(),
            scheme: self.scheme.clone(),
            config: self.config,
            session_timeout: self.session_timeout,
            registry: self.registry.clone(),
            service: self.service.clone(),
            verification_queue: self.verification_queue.clone(),
            event_publisher: self.event_publisher.clone(),
        }
    }
}

impl<N: Network, S: AggregationScheme> Handel<N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        me: ReplicaID,
        replica_set: Arc<ReplicaSet>,
        scheme: Arc<S>,
        config: SessionConfiguration,
        session_timeout: Duration,
        network: N,
        verification_queue: Sender<CryptoHash>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        Self {
            me,
            service: ContributionService::new(replica_set.clone(), network),
            replica_set,
            scheme,
            config,
            session_timeout,
            registry: Arc::new(SessionRegistry::new()),
            verification_queue,
            event_publisher,
        }
    }

    /// Start aggregating over `hash` with the local replica's partial `signature`.
    pub(crate) fn begin(&self, hash: CryptoHash, signature: SignatureBytes) {
        let Some(session) = self.session(hash) else {
            return;
        };

        let (finalized, contributions) = {
            let mut session = session.lock().unwrap();
            let finalized = session.seed_local(signature);
            (finalized, session.disseminate(Instant::now()))
        };

        if let Some(aggregate) = finalized {
            self.publish_finalize(aggregate);
        }
        self.send_contributions(hash, contributions);
    }

    /// Handle a message that the poller received from `origin`.
    pub(crate) fn on_message(&self, origin: &VerifyingKey, message: Message) {
        if let Some((origin, contribute_msg)) = self.service.inbound(origin, message) {
            self.on_receive(origin, contribute_msg);
        }
    }

    /// Score a contribution received from `origin` and, if it was queued, wake a verification worker.
    pub(crate) fn on_receive(&self, origin: ReplicaID, contribute_msg: ContributeMessage) {
        let ContributeMessage { hash, contribution } = contribute_msg;
        let Some(session) = self.session(hash) else {
            return;
        };

        let level = contribution.level;
        let outcome = session.lock().unwrap().receive(origin, contribution);
        Event::publish(
            &self.event_publisher,
            Event::ReceiveContribution(ReceiveContributionEvent {
                timestamp: SystemTime::now(),
                origin,
                hash,
                level,
                outcome,
            }),
        );

        if outcome == ReceiveOutcome::Pending {
            let _ = self.verification_queue.send(hash);
        }
    }

    /// Verify and apply the pending contributions of the session for `hash` until none is left,
    /// disseminating after every merge.
    ///
    /// The session is unlocked while a signature is being verified, so the poller and other workers can
    /// keep using it.
    pub(crate) fn verify_pending(&self, hash: CryptoHash) {
        loop {
            let Some(session) = self.registry.get(&hash) else {
                return;
            };
            let Some(job) = session.lock().unwrap().next_verification() else {
                return;
            };

            let valid = job.verify(&*self.scheme);
            let origin = job.sender();
            let job_level = job.contribution().level;

            let mut session = session.lock().unwrap();
            let outcome = session.complete_verification(job, valid);
            match outcome {
                VerificationOutcome::Rejected => Event::publish(
                    &self.event_publisher,
                    Event::RejectContribution(RejectContributionEvent {
                        timestamp: SystemTime::now(),
                        origin,
                        hash,
                        level: job_level,
                    }),
                ),
                VerificationOutcome::Stale => (),
                VerificationOutcome::Merged {
                    level,
                    completed,
                    finalized,
                } => {
                    let contributions = session.disseminate(Instant::now());
                    drop(session);

                    if completed {
                        Event::publish(
                            &self.event_publisher,
                            Event::CompleteLevel(CompleteLevelEvent {
                                timestamp: SystemTime::now(),
                                hash,
                                level,
                            }),
                        );
                    }
                    if let Some(aggregate) = finalized {
                        self.publish_finalize(aggregate);
                    }
                    self.send_contributions(hash, contributions);
                }
            }
        }
    }

    /// Disseminate for every live session, and evict the sessions that have been inactive for longer than
    /// the session timeout.
    pub(crate) fn tick(&self, now: Instant) {
        for (hash, session) in self.registry.snapshot() {
            let mut session = session.lock().unwrap();
            if now.saturating_duration_since(session.last_activity()) > self.session_timeout {
                let finalized = session.is_finalized();
                drop(session);

                self.registry.remove(&hash);
                log::debug!("Session {}: evicted", short_hash(&hash));
                Event::publish(
                    &self.event_publisher,
                    Event::EvictSession(EvictSessionEvent {
                        timestamp: SystemTime::now(),
                        hash,
                        finalized,
                    }),
                );
                continue;
            }

            let contributions = session.disseminate(now);
            drop(session);
            self.send_contributions(hash, contributions);
        }
    }

    /// Get the quorum aggregate over `hash`, if the session for `hash` has finalized.
    pub(crate) fn aggregate(&self, hash: &CryptoHash) -> Option<QuorumAggregate> {
        let session = self.registry.get(hash)?;
        let aggregate = session.lock().unwrap().finalized().cloned();
        aggregate
    }

    /// Take the quorum aggregate over `hash` and remove its session, if the session has finalized.
    pub(crate) fn take_aggregate(&self, hash: &CryptoHash) -> Option<QuorumAggregate> {
        let aggregate = self.aggregate(hash)?;
        self.registry.remove(hash);
        Some(aggregate)
    }

    pub(crate) fn session_count(&self) -> usize {
        self.registry.len()
    }

    fn session(&self, hash: CryptoHash) -> Option<SessionHandle<S>> {
        let created = self.registry.get_or_create(hash, || {
            Session::new(
                hash,
                self.me,
                &self.replica_set,
                self.config,
                self.scheme.clone(),
                Instant::now(),
            )
        });

        match created {
            Ok((session, true)) => {
                let max_level = session.lock().unwrap().max_level();
                Event::publish(
                    &self.event_publisher,
                    Event::StartSession(StartSessionEvent {
                        timestamp: SystemTime::now(),
                        hash,
                        max_level,
                    }),
                );
                Some(session)
            }
            Ok((session, false)) => Some(session),
            Err(err) => {
                log::warn!("Cannot start session {}: {:?}", short_hash(&hash), err);
                None
            }
        }
    }

    fn send_contributions(&self, hash: CryptoHash, contributions: Vec<(ReplicaID, Contribution)>) {
        if contributions.is_empty() {
            return;
        }

        let mut service = self.service.clone();
        for (peer, contribution) in contributions {
            Event::publish(
                &self.event_publisher,
                Event::Contribute(ContributeEvent {
                    timestamp: SystemTime::now(),
                    peer,
                    hash,
                    level: contribution.level,
                    coverage: contribution.bitmask.count(),
                }),
            );
            service.contribute(peer, hash, contribution);
        }
    }

    fn publish_finalize(&self, aggregate: QuorumAggregate) {
        Event::publish(
            &self.event_publisher,
            Event::Finalize(FinalizeEvent {
                timestamp: SystemTime::now(),
                aggregate,
            }),
        );
    }
}

/// Spawn a verification worker, which takes hashes of sessions with pending contributions off the shared
/// `verification_queue` and [verifies](Handel::verify_pending) them.
pub(crate) fn start_verification_worker<N, S>(
    handel: Handel<N, S>,
    verification_queue: Arc<Mutex<Receiver<CryptoHash>>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()>
where
    N: Network + 'static,
    S: AggregationScheme,
{
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Verification worker disconnected from main thread")
            }
        }

        let next = verification_queue
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_millis(10));
        match next {
            Ok(hash) => handel.verify_pending(hash),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// Spawn the disseminator, which [ticks](Handel::tick) every `dissemination_period`.
pub(crate) fn start_disseminator<N, S>(
    handel: Handel<N, S>,
    dissemination_period: Duration,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()>
where
    N: Network + 'static,
    S: AggregationScheme,
{
    thread::spawn(move || loop {
        match shutdown_signal.recv_timeout(dissemination_period) {
            Ok(()) => return,
            Err(RecvTimeoutError::Timeout) => handel.tick(Instant::now()),
            Err(RecvTimeoutError::Disconnected) => {
                panic!("Disseminator thread disconnected from main thread")
            }
        }
    })
}
