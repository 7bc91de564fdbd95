/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events an lbft replica emits while it runs.
//!
//! An event for a given action indicates that the action has been completed. Events are published
//! on a channel to the [event bus](crate::event_bus) thread, which fires the handlers registered
//! through [`LbftSpec`](crate::consenter::LbftSpec) and, if enabled, the default
//! [logging handlers](crate::logging).

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::messages::{PhaseVote, ViewChange};
use crate::types::{ChainID, ReplicaID, SeqNo};

pub enum Event {
    // Events on the proposal path.
    Propose(ProposeEvent),
    ReceivePrePrepare(ReceivePrePrepareEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),
    PassPrepare(PassPrepareEvent),
    PassCommit(PassCommitEvent),
    Committed(CommittedEvent),
    // Events on the delivery path.
    Deliver(DeliverEvent),
    FetchCommitted(FetchCommittedEvent),
    // Liveness events.
    ViewChangeVote(ViewChangeVoteEvent),
    InstallPrimary(InstallPrimaryEvent),
    InstanceTimeout(InstanceTimeoutEvent),
}

impl Event {
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            // The event bus may already have shut down.
            let _ = event_publisher.send(self);
        }
    }
}

/// The primary proposed a request batch at `seq_no`.
pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub seq_no: SeqNo,
    pub requests: usize,
}

pub struct ReceivePrePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub chain: ChainID,
    pub name: String,
    pub seq_no: SeqNo,
}

/// This replica broadcast a Prepare vote.
pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub vote: PhaseVote,
}

/// This replica broadcast a Commit vote.
pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub vote: PhaseVote,
}

pub struct PassPrepareEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub seq_no: SeqNo,
}

pub struct PassCommitEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub seq_no: SeqNo,
}

/// An instance handed its committed batch to the checkpoint window.
pub struct CommittedEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub seq_no: SeqNo,
}

/// Committed batches left the checkpoint window for block production.
pub struct DeliverEvent {
    pub timestamp: SystemTime,
    pub seq_nos: Vec<SeqNo>,
    pub transactions: usize,
}

/// This replica asked its peers for a missing committed batch.
pub struct FetchCommittedEvent {
    pub timestamp: SystemTime,
    pub seq_no: SeqNo,
}

pub struct ViewChangeVoteEvent {
    pub timestamp: SystemTime,
    pub view_change: ViewChange,
}

pub struct InstallPrimaryEvent {
    pub timestamp: SystemTime,
    pub primary: ReplicaID,
    pub h: SeqNo,
}

pub struct InstanceTimeoutEvent {
    pub timestamp: SystemTime,
    pub name: String,
    pub seq_no: SeqNo,
}
