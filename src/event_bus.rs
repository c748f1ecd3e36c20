/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which fires user-registered handlers (and loggers) for published events.

use crate::events::*;
use crate::logging::Logger;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::TryRecvError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) start_session_handlers: Vec<HandlerPtr<StartSessionEvent>>,
    pub(crate) finalize_handlers: Vec<HandlerPtr<FinalizeEvent>>,
    pub(crate) evict_session_handlers: Vec<HandlerPtr<EvictSessionEvent>>,
    pub(crate) contribute_handlers: Vec<HandlerPtr<ContributeEvent>>,
    pub(crate) receive_contribution_handlers: Vec<HandlerPtr<ReceiveContributionEvent>>,
    pub(crate) reject_contribution_handlers: Vec<HandlerPtr<RejectContributionEvent>>,
    pub(crate) complete_level_handlers: Vec<HandlerPtr<CompleteLevelEvent>>,
}

impl EventHandlers {
    /// Collect the user-registered handlers, adding the default logger of every event type in front of
    /// them if `log_events` is set.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        start_session_handler: Option<HandlerPtr<StartSessionEvent>>,
        finalize_handler: Option<HandlerPtr<FinalizeEvent>>,
        evict_session_handler: Option<HandlerPtr<EvictSessionEvent>>,
        contribute_handler: Option<HandlerPtr<ContributeEvent>>,
        receive_contribution_handler: Option<HandlerPtr<ReceiveContributionEvent>>,
        reject_contribution_handler: Option<HandlerPtr<RejectContributionEvent>>,
        complete_level_handler: Option<HandlerPtr<CompleteLevelEvent>>,
    ) -> EventHandlers {
        fn handlers<T: Logger>(log_events: bool, handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
            let mut handlers = Vec::new();
            if log_events {
                handlers.push(T::get_logger());
            }
            handlers.extend(handler);
            handlers
        }

        EventHandlers {
            start_session_handlers: handlers(log_events, start_session_handler),
            finalize_handlers: handlers(log_events, finalize_handler),
            evict_session_handlers: handlers(log_events, evict_session_handler),
            contribute_handlers: handlers(log_events, contribute_handler),
            receive_contribution_handlers: handlers(log_events, receive_contribution_handler),
            reject_contribution_handlers: handlers(log_events, reject_contribution_handler),
            complete_level_handlers: handlers(log_events, complete_level_handler),
        }
    }

    /// Check whether no handler at all is registered, in which case there is no need for an event bus.
    pub(crate) fn is_empty(&self) -> bool {
        self.start_session_handlers.is_empty()
            && self.finalize_handlers.is_empty()
            && self.evict_session_handlers.is_empty()
            && self.contribute_handlers.is_empty()
            && self.receive_contribution_handlers.is_empty()
            && self.reject_contribution_handlers.is_empty()
            && self.complete_level_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::StartSession(start_session_event) => self
                .start_session_handlers
                .iter()
                .for_each(|handler| handler(&start_session_event)),

            Event::Finalize(finalize_event) => self
                .finalize_handlers
                .iter()
                .for_each(|handler| handler(&finalize_event)),

            Event::EvictSession(evict_session_event) => self
                .evict_session_handlers
                .iter()
                .for_each(|handler| handler(&evict_session_event)),

            Event::Contribute(contribute_event) => self
                .contribute_handlers
                .iter()
                .for_each(|handler| handler(&contribute_event)),

            Event::ReceiveContribution(receive_contribution_event) => self
                .receive_contribution_handlers
                .iter()
                .for_each(|handler| handler(&receive_contribution_event)),

            Event::RejectContribution(reject_contribution_event) => self
                .reject_contribution_handlers
                .iter()
                .for_each(|handler| handler(&reject_contribution_event)),

            Event::CompleteLevel(complete_level_event) => self
                .complete_level_handlers
                .iter()
                .for_each(|handler| handler(&complete_level_event)),
        }
    }
}

/// Spawn the event bus thread. The event bus is the last thread to be shut down, so it outlives every
/// publisher that matters.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => {
                // Drain events that were published before shutdown.
                while let Ok(event) = event_subscriber.try_recv() {
                    event_handlers.fire_handlers(event)
                }
                return;
            }
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(Duration::from_millis(10)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
