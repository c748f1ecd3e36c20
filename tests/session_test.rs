//! Tests that drive a single [`Session`] by hand, standing in for the peers it aggregates with.

use std::time::{Duration, Instant};

use hotstuff_handel::{
    handel::{
        messages::Contribution,
        session::{Session, SessionConfiguration, MAX_REJECTED},
        types::{IgnoreReason, LevelState, ReceiveOutcome, VerificationOutcome},
    },
    types::{
        bitmask::Bitmask,
        crypto_primitives::{AggregationScheme, Bls, BlsKeypair},
        data_types::{ReplicaID, SignatureBytes},
    },
};
use log::LevelFilter;
use rand_core::OsRng;

mod common;

use crate::common::{
    fixtures::{
        bitmask, contribution, level_members, new_session, replica, test_hash, test_replicas,
    },
    logging::setup_logger,
};

fn finalized_count(outcomes: &[VerificationOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|outcome| {
            matches!(
                outcome,
                VerificationOutcome::Merged {
                    finalized: Some(_),
                    ..
                }
            )
        })
        .count()
}

#[test]
fn four_replicas_finalize_with_all_signers_test() {
    setup_logger(LevelFilter::Debug);

    let replicas = test_replicas(4);
    let me = replicas[1].id;
    let hash = test_hash(1);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());
    assert_eq!(session.max_level(), 2);
    assert_eq!(session.quorum_size(), 3);

    assert_eq!(session.seed_local(replica(&replicas, me).sign(&hash)), None);

    let level_1_peer = session.level_peers(1).unwrap()[0];
    let level_2_peers = session.level_peers(2).unwrap().to_vec();
    assert_eq!(level_2_peers.len(), 2);

    let level_1 = contribution(&session, &replicas, 1, &[level_1_peer]);
    assert_eq!(session.receive(level_1_peer, level_1), ReceiveOutcome::Pending);
    let level_2 = contribution(&session, &replicas, 2, &level_2_peers);
    assert_eq!(session.receive(level_2_peers[1], level_2), ReceiveOutcome::Pending);

    let outcomes = session.process_pending();
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(
        outcomes[0],
        VerificationOutcome::Merged {
            level: 1,
            completed: true,
            finalized: None
        }
    ));
    assert_eq!(finalized_count(&outcomes), 1);

    let aggregate = session.finalized().unwrap();
    assert_eq!(aggregate.hash, hash);
    assert_eq!(
        aggregate.signers,
        (0..4).map(ReplicaID::new).collect::<Vec<_>>()
    );
    assert_eq!(aggregate.bitmask.count(), 4);

    let public_keys: Vec<_> = replicas.iter().map(|r| r.keypair.public()).collect();
    assert!(Bls.verify(
        &aggregate.signature,
        &hash.bytes(),
        &public_keys.iter().collect::<Vec<_>>()
    ));
}

#[test]
fn contribution_for_nonexistent_level_is_never_merged_test() {
    let replicas = test_replicas(4);
    let me = replicas[0].id;
    let hash = test_hash(2);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());
    session.seed_local(replica(&replicas, me).sign(&hash));

    let peer = session.level_peers(1).unwrap()[0];
    for level in [0, 5] {
        let mut out_of_range = contribution(&session, &replicas, 1, &[peer]);
        out_of_range.level = level;

        assert_eq!(session.score(peer, &out_of_range), 0);
        assert_eq!(
            session.receive(peer, out_of_range),
            ReceiveOutcome::Ignored(IgnoreReason::InvalidLevel)
        );
    }

    assert!(session.next_verification().is_none());
    assert_eq!(session.coverage(), 1);
}

#[test]
fn incoming_never_regresses_to_smaller_coverage_test() {
    let replicas = test_replicas(4);
    let me = replicas[0].id;
    let hash = test_hash(3);

    // Both contributions pending at once: the larger one is verified first, the smaller one is then useless.
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());
    let peers = session.level_peers(2).unwrap().to_vec();
    let both = contribution(&session, &replicas, 2, &peers);
    let one = contribution(&session, &replicas, 2, &peers[..1]);

    assert_eq!(session.receive(peers[1], both.clone()), ReceiveOutcome::Pending);
    assert_eq!(session.receive(peers[0], one.clone()), ReceiveOutcome::Pending);
    session.process_pending();
    assert_eq!(session.incoming(2).unwrap().bitmask, bitmask(&session, &peers));
    assert_eq!(session.level_state(2), Some(LevelState::Complete));

    // The smaller one first: the larger one replaces it, and the smaller one is then refused.
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());
    assert_eq!(session.receive(peers[0], one.clone()), ReceiveOutcome::Pending);
    session.process_pending();
    assert_eq!(session.level_state(2), Some(LevelState::Partial));

    assert_eq!(session.receive(peers[1], both), ReceiveOutcome::Pending);
    session.process_pending();
    assert_eq!(session.incoming(2).unwrap().bitmask, bitmask(&session, &peers));

    assert_eq!(
        session.receive(peers[0], one),
        ReceiveOutcome::Ignored(IgnoreReason::NoNewCoverage)
    );
    assert_eq!(session.incoming(2).unwrap().bitmask.count(), 2);
}

#[test]
fn overlapping_contribution_scores_by_what_the_best_combination_gains_test() {
    let replicas = test_replicas(8);
    let me = replicas[0].id;
    let hash = test_hash(4);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());

    // Level 3 is two subtrees: {a, b} and {c, d}.
    let members = level_members(&session, 3);
    let &[a, b, c, d] = members.as_slice() else {
        panic!("level 3 of 8 replicas has 4 peers")
    };

    let first = contribution(&session, &replicas, 3, &[a, b]);
    assert_eq!(session.receive(a, first), ReceiveOutcome::Pending);
    session.process_pending();

    // Spans both subtrees but cannot be combined with {a, b}, and replacing {a, b} would lose a.
    let straddling = contribution(&session, &replicas, 3, &[b, c]);
    assert_eq!(session.score(b, &straddling), 0);

    let disjoint = contribution(&session, &replicas, 3, &[c, d]);
    assert_eq!(session.score(c, &disjoint), 2);

    let superset = contribution(&session, &replicas, 3, &[a, b, c]);
    assert_eq!(session.score(c, &superset), 1);
}

#[test]
fn larger_subtree_aggregate_replaces_partial_one_test() {
    let replicas = test_replicas(8);
    let me = replicas[0].id;
    let hash = test_hash(17);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());
    session.seed_local(replica(&replicas, me).sign(&hash));
    assert_eq!(session.quorum_size(), 6);

    // The level 1 peer and one level 2 peer are silent.
    let level_2_peer = session.level_peers(2).unwrap()[0];
    let level_2 = contribution(&session, &replicas, 2, &[level_2_peer]);
    session.receive(level_2_peer, level_2);

    let members = level_members(&session, 3);
    let &[a, b, c, d] = members.as_slice() else {
        panic!("level 3 of 8 replicas has 4 peers")
    };
    let lower = contribution(&session, &replicas, 3, &[a, b]);
    session.receive(a, lower);
    let early = contribution(&session, &replicas, 3, &[c]);
    session.receive(c, early);
    session.process_pending();
    assert_eq!(session.level_state(3), Some(LevelState::Partial));
    assert_eq!(session.coverage(), 5);
    assert!(!session.is_finalized());

    // {c, d} overlaps {c} but covers more of the same subtree, so it takes its place.
    let upper = contribution(&session, &replicas, 3, &[c, d]);
    assert_eq!(session.score(d, &upper), 1);
    assert_eq!(session.receive(d, upper), ReceiveOutcome::Pending);
    assert_eq!(finalized_count(&session.process_pending()), 1);

    assert_eq!(session.level_state(3), Some(LevelState::Complete));
    assert_eq!(
        session.incoming(3).unwrap().bitmask,
        bitmask(&session, &[a, b, c, d])
    );

    let aggregate = session.finalized().unwrap();
    assert_eq!(aggregate.signers.len(), 6);
    let public_keys: Vec<_> = aggregate
        .signers
        .iter()
        .map(|signer| replica(&replicas, *signer).keypair.public())
        .collect();
    assert!(Bls.verify(
        &aggregate.signature,
        &hash.bytes(),
        &public_keys.iter().collect::<Vec<_>>()
    ));
}

#[test]
fn unverified_contributions_do_not_keep_a_session_alive_test() {
    let replicas = test_replicas(4);
    let me = replicas[0].id;
    let hash = test_hash(18);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());
    let created = session.last_activity();

    let peer = session.level_peers(2).unwrap()[0];
    let peer_bitmask = bitmask(&session, &[peer]);
    let garbage = |i: usize| Contribution {
        level: 2,
        bitmask: peer_bitmask.clone(),
        signature: SignatureBytes::new((i as u64).to_le_bytes().to_vec()),
    };

    for i in 0..=MAX_REJECTED {
        assert_eq!(session.receive(peer, garbage(i)), ReceiveOutcome::Pending);
        let job = session.next_verification().unwrap();
        assert_eq!(
            session.complete_verification(job, false),
            VerificationOutcome::Rejected
        );
    }
    assert_eq!(session.last_activity(), created);

    // Only the most recent rejections are remembered.
    assert_eq!(
        session.receive(peer, garbage(MAX_REJECTED)),
        ReceiveOutcome::Ignored(IgnoreReason::PreviouslyRejected)
    );
    assert_eq!(session.receive(peer, garbage(0)), ReceiveOutcome::Pending);
}

#[test]
fn no_finalization_before_quorum_test() {
    let replicas = test_replicas(4);
    let me = replicas[2].id;
    let hash = test_hash(5);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());
    session.seed_local(replica(&replicas, me).sign(&hash));

    let level_1_peer = session.level_peers(1).unwrap()[0];
    let level_1 = contribution(&session, &replicas, 1, &[level_1_peer]);
    session.receive(level_1_peer, level_1);
    let outcomes = session.process_pending();
    assert_eq!(finalized_count(&outcomes), 0);
    assert_eq!(session.coverage(), 2);
    assert!(!session.is_finalized());

    let level_2_peer = session.level_peers(2).unwrap()[0];
    let level_2 = contribution(&session, &replicas, 2, &[level_2_peer]);
    session.receive(level_2_peer, level_2);
    let outcomes = session.process_pending();
    assert_eq!(finalized_count(&outcomes), 1);

    let mut expected = vec![me, level_1_peer, level_2_peer];
    expected.sort();
    assert_eq!(session.finalized().unwrap().signers, expected);
}

#[test]
fn single_replica_finalizes_on_seed_test() {
    let replicas = test_replicas(1);
    let me = replicas[0].id;
    let hash = test_hash(6);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());
    assert_eq!(session.max_level(), 0);

    let aggregate = session.seed_local(replicas[0].sign(&hash)).unwrap();
    assert_eq!(aggregate.signers, vec![me]);
    assert!(session.disseminate(Instant::now()).is_empty());
}

#[test]
fn invalid_signature_is_rejected_once_and_never_retried_test() {
    let replicas = test_replicas(4);
    let me = replicas[0].id;
    let hash = test_hash(7);
    let config = SessionConfiguration {
        initial_window: 4,
        window_shrink_factor: 4,
        ..SessionConfiguration::default()
    };
    let mut session = new_session(&replicas, me, hash, config);
    session.seed_local(replica(&replicas, me).sign(&hash));

    let peer = session.level_peers(1).unwrap()[0];
    let forged = Contribution {
        level: 1,
        bitmask: bitmask(&session, &[peer]),
        signature: BlsKeypair::generate(&mut OsRng).sign(&hash.bytes()),
    };

    assert_eq!(session.receive(peer, forged.clone()), ReceiveOutcome::Pending);
    assert_eq!(session.process_pending(), vec![VerificationOutcome::Rejected]);
    assert_eq!(session.window(1), Some(1));
    assert_eq!(session.level_state(1), Some(LevelState::Empty));

    assert_eq!(session.score(peer, &forged), 0);
    assert_eq!(
        session.receive(peer, forged),
        ReceiveOutcome::Ignored(IgnoreReason::PreviouslyRejected)
    );

    let genuine = contribution(&session, &replicas, 1, &[peer]);
    assert_eq!(session.receive(peer, genuine), ReceiveOutcome::Pending);
    assert!(matches!(
        session.process_pending().as_slice(),
        [VerificationOutcome::Merged {
            level: 1,
            completed: true,
            ..
        }]
    ));
}

#[test]
fn merging_the_same_contribution_twice_changes_nothing_test() {
    let replicas = test_replicas(4);
    let me = replicas[3].id;
    let hash = test_hash(8);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());

    let peer = session.level_peers(1).unwrap()[0];
    let level_1 = contribution(&session, &replicas, 1, &[peer]);
    session.receive(peer, level_1.clone());
    session.process_pending();
    let incoming = session.incoming(1).cloned();

    assert_eq!(
        session.receive(peer, level_1),
        ReceiveOutcome::Ignored(IgnoreReason::NoNewCoverage)
    );
    assert!(session.process_pending().is_empty());
    assert_eq!(session.incoming(1).cloned(), incoming);
}

#[test]
fn malformed_contributions_are_ignored_test() {
    let replicas = test_replicas(8);
    let me = replicas[0].id;
    let hash = test_hash(9);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());

    let level_1_peer = session.level_peers(1).unwrap()[0];
    let level_3_peer = session.level_peers(3).unwrap()[0];
    let valid = contribution(&session, &replicas, 1, &[level_1_peer]);

    let wrong_length = Contribution {
        bitmask: Bitmask::from_indices(9, [session.index_of(level_1_peer).unwrap()]),
        ..valid.clone()
    };
    let empty = Contribution {
        bitmask: Bitmask::new(8),
        ..valid.clone()
    };
    let outside_level = Contribution {
        bitmask: bitmask(&session, &[level_3_peer]),
        ..valid.clone()
    };
    let cases = [
        (level_1_peer, wrong_length, IgnoreReason::MalformedBitmask),
        (level_1_peer, empty, IgnoreReason::MalformedBitmask),
        (level_1_peer, outside_level, IgnoreReason::MalformedBitmask),
        (level_3_peer, valid.clone(), IgnoreReason::SenderNotInLevel),
        (ReplicaID::new(99), valid.clone(), IgnoreReason::UnknownSender),
        (me, valid, IgnoreReason::OwnContribution),
    ];

    for (sender, contribution, reason) in cases {
        assert_eq!(session.score(sender, &contribution), 0);
        assert_eq!(
            session.receive(sender, contribution),
            ReceiveOutcome::Ignored(reason)
        );
    }
    assert!(!session.has_pending());
}

#[test]
fn pending_buffer_keeps_the_best_contributions_test() {
    let replicas = test_replicas(8);
    let me = replicas[0].id;
    let hash = test_hash(10);
    let config = SessionConfiguration {
        pending_capacity: 1,
        ..SessionConfiguration::default()
    };
    let mut session = new_session(&replicas, me, hash, config);
    let peers = session.level_peers(3).unwrap().to_vec();

    let single = contribution(&session, &replicas, 3, &peers[0..1]);
    assert_eq!(session.receive(peers[0], single), ReceiveOutcome::Pending);

    let double = contribution(&session, &replicas, 3, &peers[1..3]);
    assert_eq!(session.receive(peers[1], double), ReceiveOutcome::Pending);

    let other_single = contribution(&session, &replicas, 3, &peers[3..4]);
    assert_eq!(
        session.receive(peers[3], other_single),
        ReceiveOutcome::Ignored(IgnoreReason::PendingFull)
    );

    let worse_from_same_sender = contribution(&session, &replicas, 3, &peers[1..2]);
    assert_eq!(
        session.receive(peers[1], worse_from_same_sender),
        ReceiveOutcome::Ignored(IgnoreReason::Superseded)
    );

    let job = session.next_verification().unwrap();
    assert_eq!(job.sender(), peers[1]);
    assert_eq!(job.score(), 2);
    assert!(session.next_verification().is_none());
}

#[test]
fn verification_order_follows_level_then_score_then_priority_test() {
    let replicas = test_replicas(8);
    let me = replicas[5].id;
    let hash = test_hash(11);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());

    let level_1_peer = session.level_peers(1).unwrap()[0];
    let peers = session.level_peers(3).unwrap().to_vec();

    for peer in &peers[0..2] {
        let single = contribution(&session, &replicas, 3, &[*peer]);
        assert_eq!(session.receive(*peer, single), ReceiveOutcome::Pending);
    }
    let double = contribution(&session, &replicas, 3, &peers[2..4]);
    assert_eq!(session.receive(peers[2], double), ReceiveOutcome::Pending);
    let level_1 = contribution(&session, &replicas, 1, &[level_1_peer]);
    assert_eq!(session.receive(level_1_peer, level_1), ReceiveOutcome::Pending);

    let mut singles = peers[0..2].to_vec();
    singles.sort_by_key(|peer| session.verification_rank(3, *peer).unwrap());

    let order: Vec<ReplicaID> = std::iter::from_fn(|| session.next_verification())
        .map(|job| job.sender())
        .collect();
    assert_eq!(
        order,
        vec![level_1_peer, peers[2], singles[0], singles[1]]
    );
}

#[test]
fn dissemination_respects_window_and_level_timeouts_test() {
    let replicas = test_replicas(8);
    let me = replicas[0].id;
    let hash = test_hash(12);
    let config = SessionConfiguration {
        initial_window: 1,
        max_window: 16,
        window_growth_factor: 2,
        level_timeout: Duration::from_secs(10),
        ..SessionConfiguration::default()
    };
    let mut session = new_session(&replicas, me, hash, config);
    let now = Instant::now();

    let own = replica(&replicas, me).sign(&hash);
    session.seed_local(own.clone());

    // Only level 1 is active, and it has a single peer.
    let level_1_peer = session.level_peers(1).unwrap()[0];
    let expected = Contribution {
        level: 1,
        bitmask: bitmask(&session, &[me]),
        signature: own.clone(),
    };
    assert_eq!(session.disseminate(now), vec![(level_1_peer, expected)]);
    assert!(session.disseminate(now).is_empty());

    // One level timeout later, level 2 starts with a window of one, and level 1 has stalled.
    let later = now + Duration::from_secs(10);
    let messages = session.disseminate(later);
    let level_2_targets: Vec<ReplicaID> = messages
        .iter()
        .filter(|(_, contribution)| contribution.level == 2)
        .map(|(peer, _)| *peer)
        .collect();
    assert_eq!(level_2_targets, vec![session.level_peers(2).unwrap()[0]]);
    assert!(messages.iter().all(|(_, contribution)| contribution.level != 3));
    assert!(messages
        .iter()
        .any(|(peer, contribution)| *peer == level_1_peer && contribution.level == 1));
    assert_eq!(session.window(1), Some(2));
}

#[test]
fn contribution_priority_orders_level_peers_test() {
    let replicas = test_replicas(8);
    let me = replicas[4].id;
    let session = new_session(&replicas, me, test_hash(13), SessionConfiguration::default());

    for level in 1..=session.max_level() {
        let ranks: Vec<usize> = session
            .level_peers(level)
            .unwrap()
            .iter()
            .map(|peer| session.contribution_rank(level, *peer).unwrap())
            .collect();
        let mut sorted = ranks.clone();
        sorted.sort();
        assert_eq!(ranks, sorted);
    }
}

#[test]
fn completed_level_starts_the_next_level_early_test() {
    let replicas = test_replicas(4);
    let me = replicas[0].id;
    let hash = test_hash(14);
    let config = SessionConfiguration {
        level_timeout: Duration::from_secs(10),
        ..SessionConfiguration::default()
    };
    let mut session = new_session(&replicas, me, hash, config);
    session.seed_local(replica(&replicas, me).sign(&hash));

    let level_1_peer = session.level_peers(1).unwrap()[0];
    let level_1 = contribution(&session, &replicas, 1, &[level_1_peer]);
    session.receive(level_1_peer, level_1);
    session.process_pending();
    assert_eq!(session.level_state(1), Some(LevelState::Complete));

    let messages = session.disseminate(Instant::now());
    assert!(session.level_start_time(2).unwrap() <= Instant::now());
    assert!(messages.iter().any(|(peer, contribution)| {
        contribution.level == 2
            && session.level_peers(2).unwrap().contains(peer)
            && contribution.bitmask == bitmask(&session, &[me, level_1_peer])
    }));
}

#[test]
fn finalized_session_flushes_once_and_goes_quiet_test() {
    let replicas = test_replicas(4);
    let me = replicas[1].id;
    let hash = test_hash(15);
    let mut session = new_session(&replicas, me, hash, SessionConfiguration::default());
    session.seed_local(replica(&replicas, me).sign(&hash));

    let level_1_peer = session.level_peers(1).unwrap()[0];
    let level_2_peers = session.level_peers(2).unwrap().to_vec();
    let level_1 = contribution(&session, &replicas, 1, &[level_1_peer]);
    let level_2 = contribution(&session, &replicas, 2, &level_2_peers);
    session.receive(level_1_peer, level_1.clone());
    session.receive(level_2_peers[0], level_2);
    assert_eq!(finalized_count(&session.process_pending()), 1);

    assert_eq!(
        session.receive(level_1_peer, level_1),
        ReceiveOutcome::Ignored(IgnoreReason::Finalized)
    );
    assert!(session.next_verification().is_none());

    let mut recipients: Vec<(ReplicaID, u32)> = session
        .disseminate(Instant::now())
        .into_iter()
        .map(|(peer, contribution)| (peer, contribution.level))
        .collect();
    recipients.sort();
    let mut expected = vec![
        (level_1_peer, 1),
        (level_2_peers[0], 2),
        (level_2_peers[1], 2),
    ];
    expected.sort();
    assert_eq!(recipients, expected);

    assert!(session.disseminate(Instant::now()).is_empty());
}

#[test]
fn all_replicas_derive_the_same_ordering_test() {
    let replicas = test_replicas(8);
    let hash = test_hash(16);
    let config = SessionConfiguration {
        shared_random_seed: 7,
        ..SessionConfiguration::default()
    };

    let sessions: Vec<Session<Bls>> = replicas
        .iter()
        .map(|replica| new_session(&replicas, replica.id, hash, config))
        .collect();

    for session in &sessions {
        assert_eq!(session.seed(), 7u64.wrapping_add(hash.prefix_u64()));
        assert_eq!(session.ordered_ids(), sessions[0].ordered_ids());
    }

    // Levels are symmetric: if q is my level-l peer, I am q's level-l peer.
    for session in &sessions {
        for level in 1..=session.max_level() {
            for peer in session.level_peers(level).unwrap() {
                let peer_session = &sessions[peer.int() as usize];
                assert!(peer_session
                    .level_peers(level)
                    .unwrap()
                    .contains(&session.me()));
            }
        }
    }
}
