/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.
//!
//! The definitions and re-exports in this module provide three categories of cryptographic primitives:
//! 1. **Cryptographic Hashes**: provided by the [`sha2`] crate.
//! 2. **Transport Identities**: Ed25519 keys provided by the [`ed25519_dalek`] crate. A replica's
//!    [`VerifyingKey`] is how the [network](crate::networking::network::Network) authenticates the origin
//!    of a message.
//! 3. **Aggregatable Signatures**: the [`AggregationScheme`] capability that the aggregation protocol is
//!    written against, and its BLS12-381 implementation [`Bls`], provided by the [`blst`] crate.

use blst::min_pk::{AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use rand_core::{CryptoRng, RngCore};

use super::data_types::{PublicKeyBytes, SignatureBytes};

// re-exports below.
pub use sha2::Digest;
pub use sha2::Sha256 as CryptoHasher;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

/// Domain separation tag of the BLS signatures produced by [`BlsKeypair::sign`].
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// The operations on aggregatable signatures that the aggregation protocol depends on.
///
/// Implementations must satisfy:
/// 1. `verify(combine(a, b), m, keys(a) ++ keys(b))` holds whenever `verify(a, m, keys(a))` and
///    `verify(b, m, keys(b))` hold, and `a` and `b` cover disjoint sets of signers.
/// 2. `combine` is associative and commutative over signatures covering disjoint sets of signers.
pub trait AggregationScheme: Send + Sync + 'static {
    /// Check that `signature` is a valid aggregate over `message` by exactly the holders of `public_keys`.
    fn verify(
        &self,
        signature: &SignatureBytes,
        message: &[u8],
        public_keys: &[&PublicKeyBytes],
    ) -> bool;

    /// Combine two signatures into one. Returns `None` if either input cannot be decoded.
    fn combine(&self, first: &SignatureBytes, second: &SignatureBytes) -> Option<SignatureBytes>;
}

/// BLS12-381 signatures in the "minimal public key size" variant (48-byte public keys, 96-byte
/// signatures).
///
/// ## Rogue key attacks
///
/// Aggregate verification against a set of public keys is only sound if every key in the replica set
/// comes with a proof of possession. Checking proofs of possession is the responsibility of whoever
/// assembles the [`ReplicaSet`](super::replica_set::ReplicaSet).
#[derive(Clone, Copy, Default)]
pub struct Bls;

impl AggregationScheme for Bls {
    fn verify(
        &self,
        signature: &SignatureBytes,
        message: &[u8],
        public_keys: &[&PublicKeyBytes],
    ) -> bool {
        if public_keys.is_empty() {
            return false;
        }

        let signature = match Signature::from_bytes(signature.bytes()) {
            Ok(signature) => signature,
            Err(_) => return false,
        };

        let public_keys: Result<Vec<PublicKey>, BLST_ERROR> = public_keys
            .iter()
            .map(|public_key| PublicKey::from_bytes(public_key.bytes()))
            .collect();
        let public_keys = match public_keys {
            Ok(public_keys) => public_keys,
            Err(_) => return false,
        };
        let public_key_refs: Vec<&PublicKey> = public_keys.iter().collect();

        signature.fast_aggregate_verify(true, message, DST, &public_key_refs)
            == BLST_ERROR::BLST_SUCCESS
    }

    fn combine(&self, first: &SignatureBytes, second: &SignatureBytes) -> Option<SignatureBytes> {
        let first = Signature::from_bytes(first.bytes()).ok()?;
        let second = Signature::from_bytes(second.bytes()).ok()?;
        let aggregate = AggregateSignature::aggregate(&[&first, &second], false).ok()?;
        Some(SignatureBytes::new(
            aggregate.to_signature().to_bytes().to_vec(),
        ))
    }
}

/// A BLS secret key, used by a replica to produce the partial signature that it hands to
/// [`Aggregator::begin`](crate::aggregator::Aggregator::begin).
#[derive(Clone)]
pub struct BlsKeypair(SecretKey);

impl BlsKeypair {
    /// Derive a keypair from input keying material. Returns `None` if `ikm` is shorter than 32 bytes.
    pub fn from_ikm(ikm: &[u8]) -> Option<BlsKeypair> {
        SecretKey::key_gen(ikm, &[]).ok().map(BlsKeypair)
    }

    /// Generate a fresh keypair from 32 bytes of randomness drawn from `rng`.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> BlsKeypair {
        let mut ikm = [0u8; 32];
        rng.fill_bytes(&mut ikm);
        // Safety: `key_gen` only fails on keying material shorter than 32 bytes.
        BlsKeypair(SecretKey::key_gen(&ikm, &[]).unwrap())
    }

    /// Sign an arbitrary `message`.
    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(message, DST, &[]).to_bytes().to_vec())
    }

    /// Get the public key of this keypair, in the form stored in the
    /// [`ReplicaSet`](super::replica_set::ReplicaSet).
    pub fn public(&self) -> PublicKeyBytes {
        PublicKeyBytes::new(self.0.sk_to_pk().to_bytes().to_vec())
    }
}

#[test]
fn bls_combine_and_verify_test() {
    use rand_core::OsRng;

    let keypairs: Vec<BlsKeypair> = (0..3).map(|_| BlsKeypair::generate(&mut OsRng)).collect();
    let public_keys: Vec<PublicKeyBytes> = keypairs.iter().map(|kp| kp.public()).collect();
    let message = b"block hash";

    let signatures: Vec<SignatureBytes> = keypairs.iter().map(|kp| kp.sign(message)).collect();
    let first_two = Bls.combine(&signatures[0], &signatures[1]).unwrap();
    let all_three = Bls.combine(&first_two, &signatures[2]).unwrap();

    assert!(Bls.verify(&first_two, message, &[&public_keys[0], &public_keys[1]]));
    assert!(Bls.verify(&all_three, message, &public_keys.iter().collect::<Vec<_>>()));
    assert!(!Bls.verify(&first_two, message, &[&public_keys[0], &public_keys[2]]));
    assert!(!Bls.verify(&all_three, b"other hash", &public_keys.iter().collect::<Vec<_>>()));
    assert!(!Bls.verify(&signatures[0], message, &[]));
}
