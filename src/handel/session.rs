/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The aggregation state of one hash.
//!
//! A [`Session`] owns every [level](super::partition) of the aggregation tree for a single
//! [`CryptoHash`]. It is a plain state machine: it does not spawn threads, does not send messages, and
//! does not look at the clock except to timestamp activity. Its driver (the
//! [`Aggregator`](crate::aggregator::Aggregator) in production, the test harness in tests) feeds it:
//! 1. The local partial signature, through [`seed_local`](Session::seed_local).
//! 2. Contributions received from peers, through [`receive`](Session::receive).
//! 3. Verification results, by taking [`next_verification`](Session::next_verification) jobs, running
//!    them against the [`AggregationScheme`], and returning them through
//!    [`complete_verification`](Session::complete_verification).
//!
//! and in turn asks it which contributions to send to whom, through [`disseminate`](Session::disseminate).
//!
//! ## Ordering and seed
//!
//! Every replica derives the same 64-bit seed for a hash by adding the first eight bytes of the hash
//! (little-endian) to the deployment's shared random seed. The seed shuffles the replica set into the
//! session's [ordering](Session::ordered_ids), and keys the [priority functions](super::priority). Since
//! the ordering changes from hash to hash, so does the aggregation tree, which spreads the load of being
//! a replica's first contact across the replica set.
//!
//! ## Finalization
//!
//! A session finalizes as soon as its coverage, counting the local signature and the incoming aggregate
//! of every level (complete or not), reaches the quorum size of the replica set. It finalizes at most
//! once. After finalizing, it ignores further contributions, performs one final round of dissemination
//! so that its peers can finalize too, and then goes quiet.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::types::{
    bitmask::Bitmask,
    crypto_primitives::AggregationScheme,
    data_types::{CryptoHash, PublicKeyBytes, ReplicaID, SignatureBytes},
    replica_set::{ReplicaInfo, ReplicaSet},
};

use super::{
    level::Level,
    messages::Contribution,
    partition::{self, PartitionError, PeerRange},
    types::{
        Aggregate, IgnoreReason, LevelState, QuorumAggregate, ReceiveOutcome, VerificationOutcome,
    },
};

/// Number of rejected payload digests a session remembers.
pub const MAX_REJECTED: usize = 1024;

/// Tunables of a [`Session`]. See the corresponding fields of the aggregator's
/// [`Configuration`](crate::aggregator::Configuration) for their meaning.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfiguration {
    pub shared_random_seed: u64,
    pub initial_window: usize,
    pub max_window: usize,
    pub window_growth_factor: usize,
    pub window_shrink_factor: usize,
    pub level_timeout: Duration,
    pub pending_capacity: usize,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            shared_random_seed: 0,
            initial_window: 1,
            max_window: 16,
            window_growth_factor: 2,
            window_shrink_factor: 4,
            level_timeout: Duration::from_millis(50),
            pending_capacity: 16,
        }
    }
}

/// Aggregation state of a single hash. See the [module-level docs](self).
pub struct Session<S: AggregationScheme> {
    hash: CryptoHash,
    me: ReplicaID,
    seed: u64,
    ordered_ids: Vec<ReplicaID>,
    positions: HashMap<ReplicaID, usize>,
    public_keys: Vec<PublicKeyBytes>,
    self_index: usize,
    max_level: u32,
    quorum_size: usize,

    // `levels[i]` is level `i + 1`.
    levels: Vec<Level>,
    own: Option<SignatureBytes>,
    rejected: HashSet<CryptoHash>,
    rejected_order: VecDeque<CryptoHash>,
    finalized: Option<QuorumAggregate>,
    flushed: bool,

    config: SessionConfiguration,
    scheme: Arc<S>,
    last_activity: Instant,
}

impl<S: AggregationScheme> Session<S> {
    /// Create the session for `hash` as seen by `me`.
    ///
    /// Level `l` becomes active `(l - 1) * level_timeout` after `now`, or earlier if every level below it
    /// completes first.
    pub fn new(
        hash: CryptoHash,
        me: ReplicaID,
        replica_set: &ReplicaSet,
        config: SessionConfiguration,
        scheme: Arc<S>,
        now: Instant,
    ) -> Result<Session<S>, PartitionError> {
        let seed = config.shared_random_seed.wrapping_add(hash.prefix_u64());

        let mut replicas: Vec<&ReplicaInfo> = replica_set.iter().collect();
        replicas.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        let ordered_ids: Vec<ReplicaID> = replicas.iter().map(|replica| replica.id).collect();
        let public_keys: Vec<PublicKeyBytes> = replicas
            .iter()
            .map(|replica| replica.public_key.clone())
            .collect();
        let positions: HashMap<ReplicaID, usize> = ordered_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, index))
            .collect();
        let self_index = *positions
            .get(&me)
            .ok_or(PartitionError::SelfNotFound { id: me })?;

        let max_level = partition::max_level(ordered_ids.len());
        let mut levels = Vec::with_capacity(max_level as usize);
        for number in 1..=max_level {
            let range = partition::range_level(&ordered_ids, me, number)?;
            let start_time = now
                .checked_add(config.level_timeout.saturating_mul(number - 1))
                .unwrap_or(now);
            levels.push(Level::new(
                number,
                range,
                &ordered_ids,
                seed,
                me,
                start_time,
                &config,
            ));
        }

        log::debug!(
            "Session {}: seed {}, ordering {:?}",
            short_hash(&hash),
            seed,
            ordered_ids
        );

        Ok(Session {
            hash,
            me,
            seed,
            ordered_ids,
            positions,
            public_keys,
            self_index,
            max_level,
            quorum_size: replica_set.quorum_size(),
            levels,
            own: None,
            rejected: HashSet::new(),
            rejected_order: VecDeque::new(),
            finalized: None,
            flushed: false,
            config,
            scheme,
            last_activity: now,
        })
    }

    /// Record the local replica's partial signature over the hash. Returns the quorum aggregate if this
    /// finalized the session.
    ///
    /// Seeding is idempotent: a second call keeps the first signature.
    pub fn seed_local(&mut self, signature: SignatureBytes) -> Option<QuorumAggregate> {
        if self.own.is_some() {
            return None;
        }
        self.own = Some(signature);
        self.last_activity = Instant::now();
        self.recompute_outgoing();
        self.try_finalize()
    }

    /// Check `contribution` from `sender` and, if it is worth verifying, queue it.
    ///
    /// A peer of the level that sends a contribution, useful or not, is owed the local replica's outgoing
    /// aggregate for the level, and gets it on the next [dissemination](Self::disseminate).
    pub fn receive(&mut self, sender: ReplicaID, contribution: Contribution) -> ReceiveOutcome {
        if self.finalized.is_none() && sender != self.me {
            let sender_index = self.index_of(sender);
            if let (Some(index), Some(level)) = (sender_index, self.level_mut(contribution.level)) {
                if level.range().contains(index) {
                    level.request(sender);
                }
            }
        }

        let score = match self.classify(sender, &contribution) {
            Ok(score) => score,
            Err(reason) => {
                log::debug!(
                    "Session {}: ignoring level {} contribution from {}: {:?}",
                    short_hash(&self.hash),
                    contribution.level,
                    sender,
                    reason
                );
                return ReceiveOutcome::Ignored(reason);
            }
        };

        let Some(level) = self.level_mut(contribution.level) else {
            return ReceiveOutcome::Ignored(IgnoreReason::InvalidLevel);
        };
        match level.insert_pending(sender, contribution, score) {
            Ok(()) => ReceiveOutcome::Pending,
            Err(reason) => ReceiveOutcome::Ignored(reason),
        }
    }

    /// Score `contribution` from `sender` against the current state of its level: the number of signers it
    /// would add, or 0 if it is not worth verifying.
    pub fn score(&self, sender: ReplicaID, contribution: &Contribution) -> usize {
        self.classify(sender, contribution).unwrap_or(0)
    }

    fn classify(
        &self,
        sender: ReplicaID,
        contribution: &Contribution,
    ) -> Result<usize, IgnoreReason> {
        if self.finalized.is_some() {
            return Err(IgnoreReason::Finalized);
        }
        if sender == self.me {
            return Err(IgnoreReason::OwnContribution);
        }
        let sender_index = *self
            .positions
            .get(&sender)
            .ok_or(IgnoreReason::UnknownSender)?;
        let level = self
            .level(contribution.level)
            .ok_or(IgnoreReason::InvalidLevel)?;
        if self.rejected.contains(&contribution.digest()) {
            return Err(IgnoreReason::PreviouslyRejected);
        }
        level.evaluate(sender_index, contribution, self.ordered_ids.len())
    }

    /// Take the most valuable pending contribution out of the session, to be verified: the lowest level
    /// with pending work first, and within a level the highest score, ties broken by verification priority.
    pub fn next_verification(&mut self) -> Option<VerificationJob> {
        if self.finalized.is_some() {
            return None;
        }

        for level in self.levels.iter_mut() {
            while let Some((sender, contribution, score)) = level.take_best_pending() {
                if self.rejected.contains(&contribution.digest()) {
                    continue;
                }
                let public_keys = contribution
                    .bitmask
                    .iter()
                    .map(|index| self.public_keys[index].clone())
                    .collect();
                return Some(VerificationJob {
                    hash: self.hash,
                    sender,
                    score,
                    contribution,
                    public_keys,
                });
            }
        }
        None
    }

    /// Apply the result of verifying `job`.
    pub fn complete_verification(
        &mut self,
        job: VerificationJob,
        valid: bool,
    ) -> VerificationOutcome {
        if self.finalized.is_some() {
            return VerificationOutcome::Stale;
        }

        let now = Instant::now();
        let config = self.config;
        let scheme = self.scheme.clone();
        let number = job.contribution.level;
        let Some(level) = self.level_mut(number) else {
            return VerificationOutcome::Stale;
        };

        if !valid {
            level.on_failure(&config);
            self.remember_rejected(job.contribution.digest());
            log::debug!(
                "Session {}: level {} contribution from {} failed verification",
                short_hash(&self.hash),
                number,
                job.sender
            );
            return VerificationOutcome::Rejected;
        }

        if !level.merge(&*scheme, &job.contribution, now, &config) {
            return VerificationOutcome::Stale;
        }
        let completed = level.is_complete();

        self.last_activity = now;
        self.recompute_outgoing();
        self.activate_levels(now);
        VerificationOutcome::Merged {
            level: number,
            completed,
            finalized: self.try_finalize(),
        }
    }

    /// Verify and apply every pending contribution inline, in priority order.
    pub fn process_pending(&mut self) -> Vec<VerificationOutcome> {
        let scheme = self.scheme.clone();
        let mut outcomes = Vec::new();
        while let Some(job) = self.next_verification() {
            let valid = job.verify(&*scheme);
            outcomes.push(self.complete_verification(job, valid));
        }
        outcomes
    }

    /// Decide which contributions to send to which peers at `now`.
    ///
    /// Each active level offers its outgoing aggregate to the first `window` of its peers, in contribution
    /// priority order, that have not been sent an aggregate of the same coverage yet. Once finalized, the
    /// session instead sends each level's outgoing aggregate to every level peer still missing it, exactly
    /// once.
    pub fn disseminate(&mut self, now: Instant) -> Vec<(ReplicaID, Contribution)> {
        let mut messages = Vec::new();
        if self.own.is_none() {
            return messages;
        }

        if self.finalized.is_some() {
            if self.flushed {
                return messages;
            }
            self.flushed = true;
            for level in self.levels.iter_mut() {
                let targets = level.take_targets(usize::MAX);
                push_contributions(level, targets, &mut messages);
            }
            return messages;
        }

        self.activate_levels(now);
        let config = self.config;
        for level in self.levels.iter_mut() {
            if level.range().is_empty() || !level.is_active(now) {
                continue;
            }
            if level.escalate_if_stalled(now, config.level_timeout, &config) {
                log::debug!(
                    "Session {}: level {} stalled, window is now {}",
                    short_hash(&self.hash),
                    level.number(),
                    level.window()
                );
            }
            let targets = level.take_targets(level.window());
            push_contributions(level, targets, &mut messages);
        }
        messages
    }

    // Every level whose lower levels are all complete starts now, if it has not started already.
    fn activate_levels(&mut self, now: Instant) {
        let mut lower_complete = self.own.is_some();
        for level in self.levels.iter_mut() {
            if lower_complete {
                level.activate(now);
            }
            lower_complete &= level.is_complete();
        }
    }

    // outgoing(l) = own ⊕ incoming(1) ⊕ ... ⊕ incoming(l - 1).
    fn recompute_outgoing(&mut self) {
        let Some(own) = &self.own else {
            return;
        };
        let mut accumulated = Some(Aggregate {
            signature: own.clone(),
            bitmask: Bitmask::singleton(self.ordered_ids.len(), self.self_index),
        });
        for level in self.levels.iter_mut() {
            level.set_outgoing(accumulated.clone());
            if let Some(incoming) = level.incoming() {
                accumulated = combine(&*self.scheme, accumulated, incoming);
            }
        }
    }

    fn try_finalize(&mut self) -> Option<QuorumAggregate> {
        if self.finalized.is_some() || self.coverage() < self.quorum_size {
            return None;
        }

        let mut aggregate = self.own.as_ref().map(|own| Aggregate {
            signature: own.clone(),
            bitmask: Bitmask::singleton(self.ordered_ids.len(), self.self_index),
        });
        for level in &self.levels {
            if let Some(incoming) = level.incoming() {
                aggregate = combine(&*self.scheme, aggregate, incoming);
            }
        }
        let aggregate = aggregate?;

        let mut signers: Vec<ReplicaID> = aggregate
            .bitmask
            .iter()
            .map(|index| self.ordered_ids[index])
            .collect();
        signers.sort();

        let quorum_aggregate = QuorumAggregate {
            hash: self.hash,
            signature: aggregate.signature,
            bitmask: aggregate.bitmask,
            signers,
        };
        log::debug!(
            "Session {}: finalized with {} of {} signers",
            short_hash(&self.hash),
            quorum_aggregate.signers.len(),
            self.ordered_ids.len()
        );
        self.finalized = Some(quorum_aggregate.clone());
        Some(quorum_aggregate)
    }

    // Forget the oldest rejected payload once `MAX_REJECTED` are remembered.
    fn remember_rejected(&mut self, digest: CryptoHash) {
        if !self.rejected.insert(digest) {
            return;
        }
        self.rejected_order.push_back(digest);
        if self.rejected_order.len() > MAX_REJECTED {
            if let Some(oldest) = self.rejected_order.pop_front() {
                self.rejected.remove(&oldest);
            }
        }
    }

    fn level(&self, number: u32) -> Option<&Level> {
        self.levels.get((number as usize).checked_sub(1)?)
    }

    fn level_mut(&mut self, number: u32) -> Option<&mut Level> {
        self.levels.get_mut((number as usize).checked_sub(1)?)
    }

    pub fn hash(&self) -> CryptoHash {
        self.hash
    }

    pub fn me(&self) -> ReplicaID {
        self.me
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Get the session's shuffled ordering of the replica set. Bitmasks are indexed by position in this
    /// ordering.
    pub fn ordered_ids(&self) -> &[ReplicaID] {
        &self.ordered_ids
    }

    /// Get the position of `id` in the [ordering](Self::ordered_ids).
    pub fn index_of(&self, id: ReplicaID) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    pub fn level_range(&self, level: u32) -> Option<PeerRange> {
        self.level(level).map(|level| level.range())
    }

    /// Get the peers of `level`, highest contribution priority first.
    pub fn level_peers(&self, level: u32) -> Option<&[ReplicaID]> {
        self.level(level).map(|level| level.peers())
    }

    pub fn level_state(&self, level: u32) -> Option<LevelState> {
        self.level(level).map(|level| level.state())
    }

    /// Get how the local replica ranks `peer` when verifying contributions at `level`.
    pub fn verification_rank(&self, level: u32, peer: ReplicaID) -> Option<usize> {
        let level = self.level(level)?;
        if peer == self.me || !self.positions.contains_key(&peer) {
            return None;
        }
        Some(level.verification_rank(&peer))
    }

    /// Get how `peer` ranks the local replica when verifying contributions at `level`.
    pub fn contribution_rank(&self, level: u32, peer: ReplicaID) -> Option<usize> {
        let level = self.level(level)?;
        if peer == self.me || !self.positions.contains_key(&peer) {
            return None;
        }
        Some(level.contribution_rank(&peer))
    }

    pub fn incoming(&self, level: u32) -> Option<&Aggregate> {
        self.level(level)?.incoming()
    }

    pub fn outgoing(&self, level: u32) -> Option<&Aggregate> {
        self.level(level)?.outgoing()
    }

    pub fn window(&self, level: u32) -> Option<usize> {
        self.level(level).map(|level| level.window())
    }

    /// Get the instant at which `level` became, or will become, active.
    pub fn level_start_time(&self, level: u32) -> Option<Instant> {
        self.level(level).map(|level| level.start_time())
    }

    pub fn has_pending(&self) -> bool {
        self.levels.iter().any(|level| level.has_pending())
    }

    /// Count the signers covered by the local signature and the incoming aggregates of all levels.
    pub fn coverage(&self) -> usize {
        // Partial levels count too: their aggregates are verified and disjoint from every other level's.
        let own = if self.own.is_some() { 1 } else { 0 };
        own + self.levels.iter().map(|level| level.coverage()).sum::<usize>()
    }

    pub fn finalized(&self) -> Option<&QuorumAggregate> {
        self.finalized.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Get the last time the session was seeded or merged a verified contribution. Unverified contributions
    /// do not count, so a peer cannot keep a session alive with invalid ones.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

/// A pending contribution taken out of a [`Session`] to be verified off the session's lock.
pub struct VerificationJob {
    hash: CryptoHash,
    sender: ReplicaID,
    score: usize,
    contribution: Contribution,
    public_keys: Vec<PublicKeyBytes>,
}

impl VerificationJob {
    /// Check the contribution's signature over the session's hash against the public keys of the signers
    /// its bitmask covers.
    pub fn verify<S: AggregationScheme + ?Sized>(&self, scheme: &S) -> bool {
        let public_keys: Vec<&PublicKeyBytes> = self.public_keys.iter().collect();
        scheme.verify(
            &self.contribution.signature,
            &self.hash.bytes(),
            &public_keys,
        )
    }

    pub fn hash(&self) -> CryptoHash {
        self.hash
    }

    pub fn sender(&self) -> ReplicaID {
        self.sender
    }

    pub fn score(&self) -> usize {
        self.score
    }

    pub fn contribution(&self) -> &Contribution {
        &self.contribution
    }
}

fn combine<S: AggregationScheme>(
    scheme: &S,
    accumulated: Option<Aggregate>,
    next: &Aggregate,
) -> Option<Aggregate> {
    let Some(accumulated) = accumulated else {
        return Some(next.clone());
    };
    match scheme.combine(&accumulated.signature, &next.signature) {
        Some(signature) => Some(Aggregate {
            signature,
            bitmask: accumulated.bitmask.union(&next.bitmask),
        }),
        None => {
            log::warn!("Failed to combine verified aggregates, keeping the smaller one");
            Some(accumulated)
        }
    }
}

fn push_contributions(
    level: &Level,
    targets: Vec<ReplicaID>,
    messages: &mut Vec<(ReplicaID, Contribution)>,
) {
    let Some(outgoing) = level.outgoing() else {
        return;
    };
    for peer in targets {
        messages.push((
            peer,
            Contribution {
                level: level.number(),
                bitmask: outgoing.bitmask.clone(),
                signature: outgoing.signature.clone(),
            },
        ));
    }
}

pub(crate) fn short_hash(hash: &CryptoHash) -> String {
    crate::logging::first_seven_base64_chars(&hash.bytes())
}
