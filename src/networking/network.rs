/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use ed25519_dalek::VerifyingKey;

use crate::types::replica_set::ReplicaSet;

use super::messages::Message;

/// Implemented by the library user to carry [`Message`]s between replicas.
///
/// ## Authenticated origins
///
/// The `VerifyingKey` that [`recv`](Self::recv) returns alongside a message must be the key of the replica
/// that actually sent it, as established by the transport (e.g., an authenticated channel). The
/// aggregator attributes contributions to their senders based on this key alone.
pub trait Network: Clone + Send {
    /// Inform the network provider of the replica set on start-up.
    fn init_replica_set(&mut self, replica_set: ReplicaSet);

    /// Send a message to all peers without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, message: Message);

    /// Receive a message from any peer. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<(VerifyingKey, Message)>;
}
