/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Translation between wire [`Message`]s and the contributions that sessions work with.

use std::sync::Arc;

use ed25519_dalek::VerifyingKey;

use crate::{
    handel::messages::{ContributeMessage, Contribution},
    types::{
        data_types::{CryptoHash, ReplicaID},
        replica_set::ReplicaSet,
    },
};

use super::{messages::Message, network::Network, sending::SenderHandle};

/// Maps transport identities to [`ReplicaID`]s on the way in, and back on the way out.
#[derive(Clone)]
pub(crate) struct ContributionService<N: Network> {
    replica_set: Arc<ReplicaSet>,
    sender: SenderHandle<N>,
}

impl<N: Network> ContributionService<N> {
    pub(crate) fn new(replica_set: Arc<ReplicaSet>, network: N) -> Self {
        Self {
            replica_set,
            sender: SenderHandle::new(network),
        }
    }

    /// Attribute `message` to the replica whose transport identity is `origin`. Messages from origins
    /// outside the replica set are dropped.
    pub(crate) fn inbound(
        &self,
        origin: &VerifyingKey,
        message: Message,
    ) -> Option<(ReplicaID, ContributeMessage)> {
        let Some(sender) = self.replica_set.id_of(origin) else {
            log::debug!("Dropping message from a peer outside the replica set");
            return None;
        };
        match message {
            Message::Contribute(contribute_msg) => Some((sender, contribute_msg)),
        }
    }

    /// Send `contribution` for the session of `hash` to `peer`.
    pub(crate) fn contribute(
        &mut self,
        peer: ReplicaID,
        hash: CryptoHash,
        contribution: Contribution,
    ) {
        let Some(peer) = self.replica_set.get(peer) else {
            log::warn!("Cannot contribute to {}: not in the replica set", peer);
            return;
        };
        self.sender.send(
            peer.verifying_key,
            ContributeMessage { hash, contribution },
        )
    }
}
