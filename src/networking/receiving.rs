/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for receiving messages from the P2P network.

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread::{self, JoinHandle},
};

use ed25519_dalek::VerifyingKey;

use super::{messages::Message, network::Network};

/// Spawn the poller thread, which polls the [`Network`] for messages and hands each one, together with
/// the key of its origin, to `on_message`.
///
/// `on_message` runs on the poller thread, so it should only do cheap work (such as scoring a
/// contribution and queueing it) and leave expensive work (such as verifying signatures) to other
/// threads.
pub(crate) fn start_polling<N, F>(
    mut network: N,
    mut on_message: F,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()>
where
    N: Network + 'static,
    F: FnMut(VerifyingKey, Message) + Send + 'static,
{
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some((origin, msg)) = network.recv() {
            on_message(origin, msg)
        } else {
            thread::yield_now()
        }
    })
}
