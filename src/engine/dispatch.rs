/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The dispatch loop: routes every consensus message to the component that handles it.
//!
//! | Message | Accepted when | Goes to |
//! |---|---|---|
//! | `RequestBatch` | we are primary, batch originates locally | [`Engine::propose`] |
//! | `PrePrepare` (local chain) | `seq_no > last_seq_no`, sent by our primary | the named instance |
//! | `PrePrepare` (foreign chain) | the batch touches our chain | the named instance, and cross-chain admission if the batch is bound for us |
//! | `Prepare` / `Commit` (local chain) | `seq_no > last_seq_no`, carries our primary | the named instance |
//! | `Prepare` / `Commit` (foreign chain) | always | the named instance |
//! | `Committed` / `FetchCommitted` | local chain, sent by a peer | the aggregation loop |
//! | `ViewChange` / `NullRequest` | local chain | the [view changer](super::view_change) |
//!
//! Everything else is dropped and logged.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::messages::{ConsensusMessage, PhaseVote, PrePrepare};
use crate::stack::Stack;
use crate::types::{ReplicaID, RequestBatch, SeqNo};

use super::view_change::ViewChanger;
use super::{AggregateInput, DispatchInput, Engine, LOOP_POLL_INTERVAL};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct Dispatcher<S: Stack> {
    engine: Arc<Engine<S>>,
    inbox: Receiver<DispatchInput>,
    shutdown_signal: Receiver<()>,
    view: ViewChanger,
    // Foreign batches bound for our chain, in arrival order, waiting to be sequenced locally.
    incoming: Vec<(String, RequestBatch)>,
    // Names of incoming batches this replica sequenced as primary and that are still in flight.
    admitted: Vec<String>,
    last_sweep: Instant,
}

impl<S: Stack> Dispatcher<S> {
    pub(crate) fn new(
        engine: Arc<Engine<S>>,
        inbox: Receiver<DispatchInput>,
        shutdown_signal: Receiver<()>,
    ) -> Self {
        let view = ViewChanger::new(&engine);
        Dispatcher {
            engine,
            inbox,
            shutdown_signal,
            view,
            incoming: Vec::new(),
            admitted: Vec::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Run the loop on a new thread. The thread hands the inbox back when it exits.
    pub(crate) fn start(mut self) -> JoinHandle<Receiver<DispatchInput>> {
        thread::spawn(move || {
            self.run();
            self.inbox
        })
    }

    fn run(&mut self) {
        loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => (),
            }
            if self.engine.is_halted() {
                return;
            }

            match self.inbox.recv_timeout(LOOP_POLL_INTERVAL) {
                Ok(DispatchInput::Message(msg)) => self.handle_consensus_msg(msg),
                Ok(DispatchInput::InstanceTimedOut { name, seq_no }) => {
                    self.view.on_instance_timeout(&self.engine, &name, seq_no)
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }

            if let Err(fatal) = self.view.on_tick(&self.engine) {
                self.engine.report_fatal(fatal);
                return;
            }
            self.admit_incoming();
            if self.last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.collect_zombies();
                self.last_sweep = Instant::now();
            }
        }
    }

    pub(crate) fn handle_consensus_msg(&mut self, msg: ConsensusMessage) {
        let local = self.engine.local_chain().clone();
        match msg {
            ConsensusMessage::RequestBatch(batch) => {
                let originates_locally = batch.chains(&local).is_ok_and(|(from, _)| from == local);
                if self.engine.is_primary() && originates_locally {
                    self.engine.propose(batch);
                } else {
                    log::debug!("dropping forwarded batch {}", batch.id);
                }
            }

            ConsensusMessage::PrePrepare(pre_prepare) if pre_prepare.chain == local => {
                if !self.accepts_local(pre_prepare.seq_no, &pre_prepare.primary_id)
                    || pre_prepare.replica_id != pre_prepare.primary_id
                {
                    log::debug!(
                        "dropping PrePrepare from {} at seq_no {}",
                        pre_prepare.replica_id,
                        pre_prepare.seq_no
                    );
                    return;
                }
                self.view.primary_alive(&self.engine);
                self.route(&pre_prepare.name.clone(), pre_prepare.into());
            }

            ConsensusMessage::PrePrepare(pre_prepare) => {
                self.handle_foreign_pre_prepare(pre_prepare)
            }

            ConsensusMessage::Prepare(vote) => self.handle_vote(vote, ConsensusMessage::Prepare),
            ConsensusMessage::Commit(vote) => self.handle_vote(vote, ConsensusMessage::Commit),

            ConsensusMessage::Committed(committed) => {
                if committed.chain == local && committed.replica_id != *self.engine.me() {
                    self.engine.aggregate(AggregateInput::Peer(committed));
                }
            }

            ConsensusMessage::FetchCommitted(fetch) => {
                if fetch.chain == local && fetch.replica_id != *self.engine.me() {
                    self.engine.aggregate(AggregateInput::Fetch(fetch));
                }
            }

            ConsensusMessage::ViewChange(view_change) => {
                self.view.on_vote(&self.engine, view_change)
            }

            ConsensusMessage::NullRequest(null_request) => {
                self.view.on_null_request(&self.engine, &null_request)
            }
        }
    }

    /// A local-chain proposal or vote is acceptable if it is not stale and names our primary.
    fn accepts_local(&self, seq_no: SeqNo, primary_id: &ReplicaID) -> bool {
        seq_no > self.engine.counters.last_seq_no()
            && self.engine.primary().as_ref() == Some(primary_id)
    }

    fn handle_foreign_pre_prepare(&mut self, pre_prepare: PrePrepare) {
        let local = self.engine.local_chain().clone();
        let (from_chain, to_chain) = match pre_prepare.request_batch.chains(&local) {
            Ok(chains) => chains,
            Err(err) => {
                log::debug!("dropping foreign PrePrepare: {}", err);
                return;
            }
        };
        if from_chain != local && to_chain != local {
            log::debug!("dropping PrePrepare between chains {} and {}", from_chain, to_chain);
            return;
        }
        let key = pre_prepare.request_batch.key(&local).ok();
        if key.as_deref() != Some(pre_prepare.name.as_str()) {
            log::debug!("dropping foreign PrePrepare with a mismatched name");
            return;
        }

        let name = pre_prepare.name.clone();
        let batch = (to_chain == local).then(|| pre_prepare.request_batch.clone());
        if !self.route(&name, pre_prepare.into()) {
            return;
        }
        if let Some(batch) = batch {
            if !self.incoming.iter().any(|(queued, _)| *queued == name) {
                self.incoming.push((name, batch));
            }
        }
    }

    fn handle_vote(&mut self, vote: PhaseVote, wrap: fn(PhaseVote) -> ConsensusMessage) {
        let name = vote.name.clone();
        if vote.chain == *self.engine.local_chain() {
            if vote.seq_no <= self.engine.counters.last_seq_no() {
                return;
            }
            match self.engine.primary() {
                Some(primary) if primary != vote.primary_id => {
                    log::debug!(
                        "dropping vote from {} for primary {}",
                        vote.replica_id,
                        vote.primary_id
                    );
                    return;
                }
                // Mid view change: only instances that already exist keep collecting votes.
                None => {
                    if let Some(instance) = self.engine.instance(&name) {
                        instance.recv_message(wrap(vote), &self.engine);
                    }
                    return;
                }
                Some(_) => (),
            }
        }
        self.route(&name, wrap(vote));
    }

    /// Deliver `msg` to the instance named `name`, creating it if needed. Returns false if the
    /// name already committed.
    fn route(&self, name: &str, msg: ConsensusMessage) -> bool {
        match self.engine.get_or_create(name) {
            Some(instance) => {
                instance.recv_message(msg, &self.engine);
                true
            }
            None => {
                log::debug!("dropping {} for committed instance", msg.kind());
                false
            }
        }
    }

    /// As primary, sequence incoming cross-chain batches, with at most `max_concurrent_num_to`
    /// in flight.
    fn admit_incoming(&mut self) {
        let engine = &self.engine;
        self.incoming.retain(|(name, _)| engine.instance(name).is_some());
        self.admitted.retain(|name| engine.instance(name).is_some());
        if !engine.is_primary() {
            self.admitted.clear();
            return;
        }

        let limit = engine.options.max_concurrent_num_to;
        for (name, batch) in &self.incoming {
            if self.admitted.len() >= limit {
                break;
            }
            if self.admitted.contains(name) {
                continue;
            }
            // Already sequenced on our chain, possibly by a previous primary.
            let sequenced = engine.instance(name).is_some_and(|instance| instance.is_started());
            if !sequenced {
                engine.propose(batch.clone());
            }
            self.admitted.push(name.clone());
        }
    }

    /// Stop instances that never received a local PrePrepare and are older than the view change
    /// period.
    fn collect_zombies(&self) {
        for instance in self.engine.instances() {
            if !instance.is_started() && instance.age() > self.engine.options.view_change_period {
                log::debug!("collecting idle instance {}", instance.name());
                instance.stop(&self.engine);
            }
        }
    }
}
