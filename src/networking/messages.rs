/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of the message variants sent between aggregators.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::handel::messages::ContributeMessage;

/// All message variants used by the aggregator.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// See: [`ContributeMessage`].
    Contribute(ContributeMessage),
}

impl From<ContributeMessage> for Message {
    fn from(value: ContributeMessage) -> Self {
        Message::Contribute(value)
    }
}

impl Message {
    /// Get the size of the inner message.
    pub fn size(&self) -> u64 {
        match self {
            Message::Contribute(msg) => msg.size(),
        }
    }
}
