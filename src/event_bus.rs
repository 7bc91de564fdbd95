/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) published by the engine and its
//! instances, and fires the handlers registered for each kind of event.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) receive_pre_prepare_handlers: Vec<HandlerPtr<ReceivePrePrepareEvent>>,
    pub(crate) prepare_handlers: Vec<HandlerPtr<PrepareEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) pass_prepare_handlers: Vec<HandlerPtr<PassPrepareEvent>>,
    pub(crate) pass_commit_handlers: Vec<HandlerPtr<PassCommitEvent>>,
    pub(crate) committed_handlers: Vec<HandlerPtr<CommittedEvent>>,
    pub(crate) deliver_handlers: Vec<HandlerPtr<DeliverEvent>>,
    pub(crate) fetch_committed_handlers: Vec<HandlerPtr<FetchCommittedEvent>>,
    pub(crate) view_change_vote_handlers: Vec<HandlerPtr<ViewChangeVoteEvent>>,
    pub(crate) install_primary_handlers: Vec<HandlerPtr<InstallPrimaryEvent>>,
    pub(crate) instance_timeout_handlers: Vec<HandlerPtr<InstanceTimeoutEvent>>,
}

/// User-registered handlers, one optional handler per event kind.
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_propose: Option<HandlerPtr<ProposeEvent>>,
    pub(crate) on_receive_pre_prepare: Option<HandlerPtr<ReceivePrePrepareEvent>>,
    pub(crate) on_prepare: Option<HandlerPtr<PrepareEvent>>,
    pub(crate) on_commit: Option<HandlerPtr<CommitEvent>>,
    pub(crate) on_pass_prepare: Option<HandlerPtr<PassPrepareEvent>>,
    pub(crate) on_pass_commit: Option<HandlerPtr<PassCommitEvent>>,
    pub(crate) on_committed: Option<HandlerPtr<CommittedEvent>>,
    pub(crate) on_deliver: Option<HandlerPtr<DeliverEvent>>,
    pub(crate) on_fetch_committed: Option<HandlerPtr<FetchCommittedEvent>>,
    pub(crate) on_view_change_vote: Option<HandlerPtr<ViewChangeVoteEvent>>,
    pub(crate) on_install_primary: Option<HandlerPtr<InstallPrimaryEvent>>,
    pub(crate) on_instance_timeout: Option<HandlerPtr<InstanceTimeoutEvent>>,
}

impl EventHandlers {
    /// Collect the user's handlers, adding the default logging handler for every event kind if
    /// `log_events` is set.
    pub(crate) fn new(log_events: bool, user: UserHandlers) -> EventHandlers {
        let mut handlers = EventHandlers::default();

        add_handler(&mut handlers.propose_handlers, log_events, user.on_propose);
        add_handler(
            &mut handlers.receive_pre_prepare_handlers,
            log_events,
            user.on_receive_pre_prepare,
        );
        add_handler(&mut handlers.prepare_handlers, log_events, user.on_prepare);
        add_handler(&mut handlers.commit_handlers, log_events, user.on_commit);
        add_handler(&mut handlers.pass_prepare_handlers, log_events, user.on_pass_prepare);
        add_handler(&mut handlers.pass_commit_handlers, log_events, user.on_pass_commit);
        add_handler(&mut handlers.committed_handlers, log_events, user.on_committed);
        add_handler(&mut handlers.deliver_handlers, log_events, user.on_deliver);
        add_handler(&mut handlers.fetch_committed_handlers, log_events, user.on_fetch_committed);
        add_handler(&mut handlers.view_change_vote_handlers, log_events, user.on_view_change_vote);
        add_handler(&mut handlers.install_primary_handlers, log_events, user.on_install_primary);
        add_handler(&mut handlers.instance_timeout_handlers, log_events, user.on_instance_timeout);

        handlers
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.propose_handlers.is_empty()
            && self.receive_pre_prepare_handlers.is_empty()
            && self.prepare_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.pass_prepare_handlers.is_empty()
            && self.pass_commit_handlers.is_empty()
            && self.committed_handlers.is_empty()
            && self.deliver_handlers.is_empty()
            && self.fetch_committed_handlers.is_empty()
            && self.view_change_vote_handlers.is_empty()
            && self.install_primary_handlers.is_empty()
            && self.instance_timeout_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::ReceivePrePrepare(receive_pre_prepare_event) => self
                .receive_pre_prepare_handlers
                .iter()
                .for_each(|handler| handler(&receive_pre_prepare_event)),

            Event::Prepare(prepare_event) => self
                .prepare_handlers
                .iter()
                .for_each(|handler| handler(&prepare_event)),

            Event::Commit(commit_event) => self
                .commit_handlers
                .iter()
                .for_each(|handler| handler(&commit_event)),

            Event::PassPrepare(pass_prepare_event) => self
                .pass_prepare_handlers
                .iter()
                .for_each(|handler| handler(&pass_prepare_event)),

            Event::PassCommit(pass_commit_event) => self
                .pass_commit_handlers
                .iter()
                .for_each(|handler| handler(&pass_commit_event)),

            Event::Committed(committed_event) => self
                .committed_handlers
                .iter()
                .for_each(|handler| handler(&committed_event)),

            Event::Deliver(deliver_event) => self
                .deliver_handlers
                .iter()
                .for_each(|handler| handler(&deliver_event)),

            Event::FetchCommitted(fetch_committed_event) => self
                .fetch_committed_handlers
                .iter()
                .for_each(|handler| handler(&fetch_committed_event)),

            Event::ViewChangeVote(view_change_vote_event) => self
                .view_change_vote_handlers
                .iter()
                .for_each(|handler| handler(&view_change_vote_event)),

            Event::InstallPrimary(install_primary_event) => self
                .install_primary_handlers
                .iter()
                .for_each(|handler| handler(&install_primary_event)),

            Event::InstanceTimeout(instance_timeout_event) => self
                .instance_timeout_handlers
                .iter()
                .for_each(|handler| handler(&instance_timeout_event)),
        }
    }
}

fn add_handler<T: Logger>(
    handlers: &mut Vec<HandlerPtr<T>>,
    log_events: bool,
    user_handler: Option<HandlerPtr<T>>,
) {
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(user_handler) = user_handler {
        handlers.push(user_handler);
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}
