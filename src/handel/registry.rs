/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The table of live sessions, keyed by hash.
//!
//! The registry lock is only ever held to look up, insert, or remove an entry. Callers must release it
//! before locking a session, and must never take it while holding a session lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::types::{crypto_primitives::AggregationScheme, data_types::CryptoHash};

use super::{partition::PartitionError, session::Session};

pub(crate) type SessionHandle<S> = Arc<Mutex<Session<S>>>;

pub(crate) struct SessionRegistry<S: AggregationScheme> {
    sessions: Mutex<HashMap<CryptoHash, SessionHandle<S>>>,
}

impl<S: AggregationScheme> SessionRegistry<S> {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get the session for `hash`, creating it with `create` if there is none. Also returns whether the
    /// session was created by this call.
    pub(crate) fn get_or_create(
        &self,
        hash: CryptoHash,
        create: impl FnOnce() -> Result<Session<S>, PartitionError>,
    ) -> Result<(SessionHandle<S>, bool), PartitionError> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&hash) {
            return Ok((session.clone(), false));
        }
        let session = Arc::new(Mutex::new(create()?));
        sessions.insert(hash, session.clone());
        Ok((session, true))
    }

    pub(crate) fn get(&self, hash: &CryptoHash) -> Option<SessionHandle<S>> {
        self.sessions.lock().unwrap().get(hash).cloned()
    }

    pub(crate) fn remove(&self, hash: &CryptoHash) -> Option<SessionHandle<S>> {
        self.sessions.lock().unwrap().remove(hash)
    }

    /// Get every live session. The returned handles stay valid after the sessions are removed.
    pub(crate) fn snapshot(&self) -> Vec<(CryptoHash, SessionHandle<S>)> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(hash, session)| (*hash, session.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
