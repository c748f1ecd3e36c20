/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Mutable aggregation state of a single level within a session.

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use crate::types::{
    bitmask::Bitmask, crypto_primitives::AggregationScheme, data_types::ReplicaID,
};

use super::{
    messages::Contribution,
    partition::PeerRange,
    priority::{contribution_priority, verification_priority},
    session::SessionConfiguration,
    types::{Aggregate, IgnoreReason, LevelState},
};

pub(crate) struct Level {
    number: u32,
    range: PeerRange,

    // Peers of this level, highest contribution priority first.
    peers: Vec<ReplicaID>,
    verification_priority: HashMap<ReplicaID, usize>,
    contribution_priority: HashMap<ReplicaID, usize>,

    // Best verified aggregate per subtree of `range`, keyed by the smallest subtree containing its signers.
    verified: HashMap<PeerRange, Aggregate>,
    // The best disjoint combination of `verified`.
    incoming: Option<Aggregate>,
    outgoing: Option<Aggregate>,

    pending: HashMap<ReplicaID, Contribution>,
    pending_capacity: usize,

    // Coverage count of the last outgoing aggregate sent to each peer.
    sent: HashMap<ReplicaID, usize>,

    // Peers that contributed to this level since the last dissemination. They are owed our outgoing
    // aggregate regardless of the window.
    requested: HashSet<ReplicaID>,

    start_time: Instant,
    last_progress: Instant,
    window: usize,
}

impl Level {
    pub(crate) fn new(
        number: u32,
        range: PeerRange,
        ordered_ids: &[ReplicaID],
        seed: u64,
        me: ReplicaID,
        start_time: Instant,
        config: &SessionConfiguration,
    ) -> Level {
        let verification_priority = verification_priority(ordered_ids, seed, me, number);
        let contribution_priority = contribution_priority(ordered_ids, seed, me, number);

        let mut peers: Vec<ReplicaID> = range.indices().map(|i| ordered_ids[i]).collect();
        peers.sort_by_key(|peer| contribution_priority.get(peer).copied().unwrap_or(usize::MAX));

        Level {
            number,
            range,
            peers,
            verification_priority,
            contribution_priority,
            verified: HashMap::new(),
            incoming: None,
            outgoing: None,
            pending: HashMap::new(),
            pending_capacity: config.pending_capacity,
            sent: HashMap::new(),
            requested: HashSet::new(),
            start_time,
            last_progress: start_time,
            window: config.initial_window,
        }
    }

    pub(crate) fn number(&self) -> u32 {
        self.number
    }

    pub(crate) fn range(&self) -> PeerRange {
        self.range
    }

    pub(crate) fn peers(&self) -> &[ReplicaID] {
        &self.peers
    }

    pub(crate) fn verification_rank(&self, peer: &ReplicaID) -> usize {
        self.verification_priority
            .get(peer)
            .copied()
            .unwrap_or(usize::MAX)
    }

    pub(crate) fn contribution_rank(&self, peer: &ReplicaID) -> usize {
        self.contribution_priority
            .get(peer)
            .copied()
            .unwrap_or(usize::MAX)
    }

    pub(crate) fn incoming(&self) -> Option<&Aggregate> {
        self.incoming.as_ref()
    }

    pub(crate) fn outgoing(&self) -> Option<&Aggregate> {
        self.outgoing.as_ref()
    }

    pub(crate) fn set_outgoing(&mut self, outgoing: Option<Aggregate>) {
        self.outgoing = outgoing;
    }

    pub(crate) fn window(&self) -> usize {
        self.window
    }

    pub(crate) fn start_time(&self) -> Instant {
        self.start_time
    }

    pub(crate) fn coverage(&self) -> usize {
        self.incoming
            .as_ref()
            .map(|incoming| incoming.bitmask.count())
            .unwrap_or(0)
    }

    pub(crate) fn state(&self) -> LevelState {
        let coverage = self.coverage();
        if coverage == self.range.len() {
            LevelState::Complete
        } else if coverage == 0 {
            LevelState::Empty
        } else {
            LevelState::Partial
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state() == LevelState::Complete
    }

    /// Check `contribution` from the peer at `sender_index` against this level, returning its score.
    pub(crate) fn evaluate(
        &self,
        sender_index: usize,
        contribution: &Contribution,
        ordering_len: usize,
    ) -> Result<usize, IgnoreReason> {
        let bitmask = &contribution.bitmask;
        if bitmask.len() != ordering_len
            || !bitmask.is_well_formed()
            || bitmask.is_empty()
            || !bitmask.is_within(self.range.min, self.range.max)
        {
            return Err(IgnoreReason::MalformedBitmask);
        }
        if !self.range.contains(sender_index) {
            return Err(IgnoreReason::SenderNotInLevel);
        }

        match self.gain(bitmask) {
            0 => Err(IgnoreReason::NoNewCoverage),
            gain => Ok(gain),
        }
    }

    /// Count the signers that the incoming aggregate would gain if a contribution covering `bitmask` were
    /// verified. Zero if it does not beat the aggregate already kept for its subtree, or if the best
    /// combination including it would drop signers the incoming aggregate already covers.
    fn gain(&self, bitmask: &Bitmask) -> usize {
        let subtree = self.subtree_of(bitmask);
        if let Some(kept) = self.verified.get(&subtree) {
            if kept.bitmask.count() >= bitmask.count() {
                return 0;
            }
        }

        let extra = Some((subtree, bitmask));
        let (_, selection) = self.best_cover(self.range, extra);
        let Some(cover) = selection
            .iter()
            .filter_map(|node| self.candidate(*node, extra))
            .fold(None, |cover: Option<Bitmask>, next| match cover {
                None => Some(next.clone()),
                Some(cover) => Some(cover.union(next)),
            })
        else {
            return 0;
        };

        match &self.incoming {
            None => cover.count(),
            Some(incoming) if incoming.bitmask.is_subset_of(&cover) => {
                cover.count() - incoming.bitmask.count()
            }
            Some(_) => 0,
        }
    }

    /// Find the smallest subtree of the level range that contains every signer in `bitmask`.
    fn subtree_of(&self, bitmask: &Bitmask) -> PeerRange {
        let mut subtree = self.range;
        while subtree.len() > 1 {
            let (lower, upper) = subtree.halves();
            if bitmask.is_within(lower.min, lower.max) {
                subtree = lower;
            } else if bitmask.is_within(upper.min, upper.max) {
                subtree = upper;
            } else {
                break;
            }
        }
        subtree
    }

    // The aggregate kept for `subtree`, or `extra` if it is for the same subtree and covers more.
    fn candidate<'a>(
        &'a self,
        subtree: PeerRange,
        extra: Option<(PeerRange, &'a Bitmask)>,
    ) -> Option<&'a Bitmask> {
        let kept = self.verified.get(&subtree).map(|kept| &kept.bitmask);
        match extra {
            Some((extra_subtree, bitmask))
                if extra_subtree == subtree
                    && kept.map_or(true, |kept| bitmask.count() > kept.count()) =>
            {
                Some(bitmask)
            }
            _ => kept,
        }
    }

    /// Pick the subtrees of `subtree` whose aggregates together cover the most signers. Aggregates of
    /// distinct subtrees in the returned selection are disjoint. Returns the covered count and the selection.
    fn best_cover(
        &self,
        subtree: PeerRange,
        extra: Option<(PeerRange, &Bitmask)>,
    ) -> (usize, Vec<PeerRange>) {
        let whole = self
            .candidate(subtree, extra)
            .map(|bitmask| (bitmask.count(), vec![subtree]));
        let split = (subtree.len() > 1).then(|| {
            let (lower, upper) = subtree.halves();
            let (lower_count, mut selection) = self.best_cover(lower, extra);
            let (upper_count, upper_selection) = self.best_cover(upper, extra);
            selection.extend(upper_selection);
            (lower_count + upper_count, selection)
        });

        match (whole, split) {
            (Some(whole), Some(split)) if whole.0 > split.0 => whole,
            (_, Some(split)) => split,
            (Some(whole), None) => whole,
            (None, None) => (0, Vec::new()),
        }
    }

    // Combine the aggregates of the best selection over the whole level.
    fn combine_best<S: AggregationScheme>(&self, scheme: &S) -> Option<Aggregate> {
        let (_, selection) = self.best_cover(self.range, None);
        let mut aggregates = selection.iter().filter_map(|node| self.verified.get(node));
        let first = aggregates.next()?.clone();
        aggregates.try_fold(first, |combined, next| {
            Some(Aggregate {
                signature: scheme.combine(&combined.signature, &next.signature)?,
                bitmask: combined.bitmask.union(&next.bitmask),
            })
        })
    }

    /// Put `contribution` into the pending buffer.
    pub(crate) fn insert_pending(
        &mut self,
        sender: ReplicaID,
        contribution: Contribution,
        score: usize,
    ) -> Result<(), IgnoreReason> {
        if let Some(existing) = self.pending.get(&sender) {
            if self.gain(&existing.bitmask) >= score {
                return Err(IgnoreReason::Superseded);
            }
            self.pending.insert(sender, contribution);
            return Ok(());
        }

        if self.pending.len() >= self.pending_capacity {
            let rank = self.verification_rank(&sender);
            let Some((worst, worst_key)) = self
                .pending
                .iter()
                .map(|(peer, pending)| {
                    (
                        *peer,
                        (
                            self.gain(&pending.bitmask),
                            Reverse(self.verification_rank(peer)),
                        ),
                    )
                })
                .min_by_key(|(_, key)| *key)
            else {
                return Err(IgnoreReason::PendingFull);
            };
            if (score, Reverse(rank)) <= worst_key {
                return Err(IgnoreReason::PendingFull);
            }
            self.pending.remove(&worst);
        }

        self.pending.insert(sender, contribution);
        Ok(())
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Remove and return the pending contribution with the highest score, breaking ties by verification
    /// priority. Pending contributions that no longer score are dropped along the way.
    pub(crate) fn take_best_pending(&mut self) -> Option<(ReplicaID, Contribution, usize)> {
        let scores: Vec<(ReplicaID, usize)> = self
            .pending
            .iter()
            .map(|(peer, pending)| (*peer, self.gain(&pending.bitmask)))
            .collect();

        let mut best: Option<(ReplicaID, usize)> = None;
        for (peer, score) in scores {
            if score == 0 {
                self.pending.remove(&peer);
                continue;
            }
            let better = match best {
                None => true,
                Some((best_peer, best_score)) => {
                    (score, Reverse(self.verification_rank(&peer)))
                        > (best_score, Reverse(self.verification_rank(&best_peer)))
                }
            };
            if better {
                best = Some((peer, score));
            }
        }

        let (peer, score) = best?;
        let contribution = self.pending.remove(&peer)?;
        Some((peer, contribution, score))
    }

    /// Keep a verified `contribution` for its subtree if it covers more than the aggregate kept there, and
    /// rebuild the incoming aggregate. Returns whether the incoming aggregate changed, which it only does
    /// by strictly growing.
    pub(crate) fn merge<S: AggregationScheme>(
        &mut self,
        scheme: &S,
        contribution: &Contribution,
        now: Instant,
        config: &SessionConfiguration,
    ) -> bool {
        let subtree = self.subtree_of(&contribution.bitmask);
        if let Some(kept) = self.verified.get(&subtree) {
            if kept.bitmask.count() >= contribution.bitmask.count() {
                return false;
            }
        }
        self.verified.insert(
            subtree,
            Aggregate {
                signature: contribution.signature.clone(),
                bitmask: contribution.bitmask.clone(),
            },
        );

        let Some(best) = self.combine_best(scheme) else {
            log::warn!("Failed to combine verified aggregates of level {}", self.number);
            return false;
        };
        let grows = match &self.incoming {
            None => true,
            Some(incoming) => {
                best.bitmask.count() > incoming.bitmask.count()
                    && incoming.bitmask.is_subset_of(&best.bitmask)
            }
        };
        if !grows {
            return false;
        }

        self.incoming = Some(best);
        self.on_progress(now, config);
        true
    }

    fn on_progress(&mut self, now: Instant, config: &SessionConfiguration) {
        self.grow_window(config);
        self.last_progress = now;
    }

    pub(crate) fn on_failure(&mut self, config: &SessionConfiguration) {
        self.window = (self.window / config.window_shrink_factor.max(1)).max(1);
    }

    fn grow_window(&mut self, config: &SessionConfiguration) {
        self.window = self
            .window
            .saturating_mul(config.window_growth_factor)
            .min(config.max_window)
            .max(1);
    }

    /// Bring the level's start time forward to `now`, used when every lower level completed early.
    pub(crate) fn activate(&mut self, now: Instant) {
        if now < self.start_time {
            self.start_time = now;
        }
    }

    pub(crate) fn is_active(&self, now: Instant) -> bool {
        now >= self.start_time
    }

    /// If the level is active and incomplete but has not made progress for `level_timeout`, grow its
    /// window and forget which peers were already sent the current outgoing aggregate. Returns whether the
    /// level escalated.
    pub(crate) fn escalate_if_stalled(
        &mut self,
        now: Instant,
        level_timeout: Duration,
        config: &SessionConfiguration,
    ) -> bool {
        if !self.is_active(now) || self.is_complete() {
            return false;
        }

        let quiet_since = self.last_progress.max(self.start_time);
        if now.saturating_duration_since(quiet_since) < level_timeout {
            return false;
        }

        self.grow_window(config);
        self.sent.clear();
        self.last_progress = now;
        true
    }

    /// Record that `peer` contributed to this level, so that it gets our outgoing aggregate on the next
    /// dissemination.
    pub(crate) fn request(&mut self, peer: ReplicaID) {
        self.requested.insert(peer);
    }

    /// Pick the peers that should be sent the current outgoing aggregate: those that have not yet been sent
    /// an aggregate of the same coverage, highest contribution priority first, at most `limit` of them,
    /// plus every such peer that contributed since the last call. The picked peers are recorded as sent.
    pub(crate) fn take_targets(&mut self, limit: usize) -> Vec<ReplicaID> {
        let requested = std::mem::take(&mut self.requested);
        let Some(count) = self.outgoing.as_ref().map(|o| o.bitmask.count()) else {
            return Vec::new();
        };

        let targets: Vec<ReplicaID> = self
            .peers
            .iter()
            .filter(|peer| self.sent.get(*peer).map_or(true, |sent| *sent < count))
            .enumerate()
            .filter(|(position, peer)| *position < limit || requested.contains(*peer))
            .map(|(_, peer)| *peer)
            .collect();
        for peer in &targets {
            self.sent.insert(*peer, count);
        }
        targets
    }
}
