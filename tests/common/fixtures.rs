use std::{sync::Arc, time::Instant};

use ed25519_dalek::SigningKey;
use hotstuff_handel::{
    handel::{
        messages::Contribution,
        session::{Session, SessionConfiguration},
    },
    types::{
        bitmask::Bitmask,
        crypto_primitives::{AggregationScheme, Bls, BlsKeypair},
        data_types::{CryptoHash, ReplicaID, SignatureBytes},
        replica_set::{ReplicaInfo, ReplicaSet},
    },
};
use rand_core::OsRng;

/// The keys of one replica taking part in a test.
pub(crate) struct TestReplica {
    pub(crate) id: ReplicaID,
    pub(crate) signing_key: SigningKey,
    pub(crate) keypair: BlsKeypair,
}

impl TestReplica {
    pub(crate) fn sign(&self, hash: &CryptoHash) -> SignatureBytes {
        self.keypair.sign(&hash.bytes())
    }
}

/// Create `n` replicas with IDs `0..n` and fresh keys.
pub(crate) fn test_replicas(n: usize) -> Vec<TestReplica> {
    let mut csprg = OsRng {};
    (0..n)
        .map(|i| TestReplica {
            id: ReplicaID::new(i as u32),
            signing_key: SigningKey::generate(&mut csprg),
            keypair: BlsKeypair::generate(&mut csprg),
        })
        .collect()
}

pub(crate) fn replica_set(replicas: &[TestReplica]) -> ReplicaSet {
    let mut replica_set = ReplicaSet::new();
    for replica in replicas {
        replica_set.put(ReplicaInfo {
            id: replica.id,
            verifying_key: replica.signing_key.verifying_key(),
            public_key: replica.keypair.public(),
        });
    }
    replica_set
}

pub(crate) fn test_hash(seed: u8) -> CryptoHash {
    let mut bytes = [0u8; 32];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = seed.wrapping_mul(31).wrapping_add(i as u8);
    }
    CryptoHash::new(bytes)
}

/// Create the session for `hash` as seen by `me`.
pub(crate) fn new_session(
    replicas: &[TestReplica],
    me: ReplicaID,
    hash: CryptoHash,
    config: SessionConfiguration,
) -> Session<Bls> {
    Session::new(
        hash,
        me,
        &replica_set(replicas),
        config,
        Arc::new(Bls),
        Instant::now(),
    )
    .unwrap()
}

pub(crate) fn replica(replicas: &[TestReplica], id: ReplicaID) -> &TestReplica {
    replicas.iter().find(|replica| replica.id == id).unwrap()
}

/// Build a valid contribution for `level` of `session`, signed by `signers`.
pub(crate) fn contribution(
    session: &Session<Bls>,
    replicas: &[TestReplica],
    level: u32,
    signers: &[ReplicaID],
) -> Contribution {
    let hash = session.hash();
    let signature = signers
        .iter()
        .map(|id| replica(replicas, *id).sign(&hash))
        .reduce(|first, second| Bls.combine(&first, &second).unwrap())
        .unwrap();
    Contribution {
        level,
        bitmask: bitmask(session, signers),
        signature,
    }
}

/// Get the peers of `level` of `session` in ordering order, so that the first half of them forms one
/// subtree and the second half the other.
pub(crate) fn level_members(session: &Session<Bls>, level: u32) -> Vec<ReplicaID> {
    session
        .level_range(level)
        .unwrap()
        .indices()
        .map(|index| session.ordered_ids()[index])
        .collect()
}

pub(crate) fn bitmask(session: &Session<Bls>, signers: &[ReplicaID]) -> Bitmask {
    Bitmask::from_indices(
        session.ordered_ids().len(),
        signers.iter().map(|id| session.index_of(*id).unwrap()),
    )
}
