/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking.
//!
//! The aggregator does not open connections itself. Instead, the library user provides an implementation
//! of the [`Network`](network::Network) trait, which delivers Borsh-serializable [`Message`]s between
//! replicas and tells the aggregator which replica (identified by its Ed25519
//! [`VerifyingKey`](ed25519_dalek::VerifyingKey)) each received message came from.
//!
//! [`Message`]: messages::Message

pub mod network;

pub mod messages;

pub(crate) mod receiving;

pub(crate) mod sending;

pub(crate) mod service;
