/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The aggregation loop and the checkpoint window.
//!
//! Instances commit out of order. The checkpoint window buffers committed batches by sequence number
//! and delivers them to block production strictly in order, as one [`CommittedTxs`] per contiguous
//! run starting right after `exec_seq_no`. Delivered batches stay in the window for `k` more
//! sequence numbers so that lagging peers can fetch them.
//!
//! A batch enters the window in one of two ways:
//! 1. A local instance commits it.
//! 2. `q` peers on the local chain report the same [`Committed`] batch at the same sequence
//!    number. This is how a replica that missed a batch catches up.
//!
//! When the window has a gap at `exec_seq_no + 1`, the loop asks its peers for the missing batch
//! with a [`FetchCommitted`], at most once per `block_timeout`. A batch buffered more than `k` past
//! `exec_seq_no` means this replica cannot catch up on its own, which is reported as a
//! [`FatalError::CheckpointDivergence`].

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};

use crate::ballot::Ballot;
use crate::events::{DeliverEvent, Event, FetchCommittedEvent};
use crate::messages::{Committed, ConsensusMessage, FetchCommitted};
use crate::stack::{Stack, Transaction};
use crate::types::{RequestBatch, SeqNo};

use super::{now_nanos, AggregateInput, CommittedTxs, Engine, FatalError, LOOP_POLL_INTERVAL};

pub(crate) struct Aggregator<S: Stack> {
    engine: Arc<Engine<S>>,
    inbox: Receiver<AggregateInput>,
    shutdown_signal: Receiver<()>,
    // Committed reports from peers, by instance name.
    peer_reports: HashMap<String, Ballot<Committed>>,
    last_fetch: Option<Instant>,
}

impl<S: Stack> Aggregator<S> {
    pub(crate) fn new(
        engine: Arc<Engine<S>>,
        inbox: Receiver<AggregateInput>,
        shutdown_signal: Receiver<()>,
    ) -> Self {
        Aggregator {
            engine,
            inbox,
            shutdown_signal,
            peer_reports: HashMap::new(),
            last_fetch: None,
        }
    }

    /// Run the loop on a new thread. The thread hands the inbox back when it exits.
    pub(crate) fn start(mut self) -> JoinHandle<Receiver<AggregateInput>> {
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
                Ok(input) => self.handle(input),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }

            if let Err(fatal) = self.checkpoint() {
                self.engine.report_fatal(fatal);
                return;
            }
        }
    }

    pub(crate) fn handle(&mut self, input: AggregateInput) {
        match input {
            AggregateInput::Local(committed) => self.on_local_commit(committed),
            AggregateInput::Peer(committed) => self.on_peer_report(committed),
            AggregateInput::Fetch(fetch) => self.on_fetch(fetch),
        }
    }

    fn on_local_commit(&mut self, committed: Committed) {
        let engine = &self.engine;
        engine.counters.raise_last(committed.seq_no);
        engine.retire(&committed.name, committed.seq_no);
        self.peer_reports.remove(&committed.name);
        if committed.seq_no > engine.counters.exec_seq_no() {
            engine
                .checkpoint
                .write()
                .unwrap()
                .entry(committed.seq_no)
                .or_insert(committed.request_batch);
        }
    }

    fn on_peer_report(&mut self, committed: Committed) {
        let engine = &self.engine;
        if engine.is_retired(&committed.name) || committed.seq_no <= engine.counters.exec_seq_no() {
            return;
        }

        let ballot = self.peer_reports.entry(committed.name.clone()).or_default();
        ballot.add(committed.replica_id.clone(), committed.clone());
        if ballot.voter_by_ticket(&committed) < engine.options.quorum() {
            return;
        }

        log::info!(
            "batch {} at seq_no {} certified by {} peers",
            committed.name,
            committed.seq_no,
            engine.options.quorum()
        );
        self.peer_reports.remove(&committed.name);
        engine
            .checkpoint
            .write()
            .unwrap()
            .entry(committed.seq_no)
            .or_insert(committed.request_batch);
        engine.counters.raise_last(committed.seq_no);
        engine.retire(&committed.name, committed.seq_no);

        // A started instance releases the gates itself when it commits or stops.
        match engine.instance(&committed.name) {
            Some(instance) if instance.is_started() => (),
            Some(instance) => {
                instance.stop(engine);
                engine.pre_prepare_gate.notify(committed.seq_no);
                engine.commit_gate.notify(committed.seq_no);
            }
            None => {
                engine.pre_prepare_gate.notify(committed.seq_no);
                engine.commit_gate.notify(committed.seq_no);
            }
        }
    }

    fn on_fetch(&self, fetch: FetchCommitted) {
        let engine = &self.engine;
        let Some(batch) = engine.checkpoint.read().unwrap().get(&fetch.seq_no).cloned() else {
            return;
        };
        let name = match batch.key(engine.local_chain()) {
            Ok(name) => name,
            Err(err) => {
                log::warn!("cannot answer fetch for seq_no {}: {}", fetch.seq_no, err);
                return;
            }
        };
        log::debug!("sending batch at seq_no {} to {}", fetch.seq_no, fetch.replica_id);
        let committed = Committed {
            name,
            chain: engine.local_chain().clone(),
            replica_id: engine.me().clone(),
            seq_no: fetch.seq_no,
            request_batch: batch,
        };
        engine.broadcast(&committed.into(), &[engine.local_chain()]);
    }

    /// Deliver every batch that is next in sequence, then check the window for gaps.
    pub(crate) fn checkpoint(&mut self) -> Result<(), FatalError> {
        let engine = &self.engine;
        let k = engine.options.k;
        let mut window = engine.checkpoint.write().unwrap();

        let mut exec_seq_no = engine.counters.exec_seq_no();
        let mut run: Vec<(SeqNo, &RequestBatch)> = Vec::new();
        while let Some(batch) = window.get(&(exec_seq_no + 1)) {
            exec_seq_no += 1;
            run.push((exec_seq_no, batch));
        }

        if !run.is_empty() {
            let seq_nos: Vec<SeqNo> = run.iter().map(|(seq_no, _)| *seq_no).collect();
            let transactions: Vec<S::Tx> = run
                .iter()
                .flat_map(|(_, batch)| batch.requests.iter())
                .filter_map(|request| {
                    let tx = engine.stack.new_transaction(&request.transaction);
                    if tx.is_none() {
                        log::warn!("dropping undecodable request with nonce {}", request.nonce);
                    }
                    tx
                })
                .collect();

            engine.stack.removes(&transactions);
            {
                let mut in_flight_txs = engine.in_flight_txs.lock().unwrap();
                for tx in &transactions {
                    in_flight_txs.remove(&tx.hash());
                }
            }
            engine.counters.set_exec(exec_seq_no);

            Event::Deliver(DeliverEvent {
                timestamp: SystemTime::now(),
                seq_nos: seq_nos.clone(),
                transactions: transactions.len(),
            })
            .publish(&engine.event_publisher);
            engine.deliver(CommittedTxs {
                seq_nos,
                time: now_nanos(),
                transactions,
            });

            // Keep the last k delivered batches for peers that fetch them.
            let floor = exec_seq_no.saturating_sub(k as SeqNo);
            *window = window.split_off(&(floor + 1));
            engine.prune_retired(floor);
            self.peer_reports.retain(|_, ballot| {
                ballot.iter_ticket().iter().any(|(committed, _)| committed.seq_no > floor)
            });
        }

        let Some(&highest) = window.keys().next_back() else {
            return Ok(());
        };
        drop(window);

        if highest > exec_seq_no + k as SeqNo {
            return Err(FatalError::CheckpointDivergence {
                exec_seq_no,
                buffered: highest,
                window: k,
            });
        }
        if highest > exec_seq_no {
            self.fetch_missing(exec_seq_no + 1);
        }
        Ok(())
    }

    fn fetch_missing(&mut self, seq_no: SeqNo) {
        let engine = &self.engine;
        if self
            .last_fetch
            .is_some_and(|last_fetch| last_fetch.elapsed() < engine.options.block_timeout)
        {
            return;
        }
        self.last_fetch = Some(Instant::now());

        log::info!("asking peers for the batch at seq_no {}", seq_no);
        let fetch = FetchCommitted {
            replica_id: engine.me().clone(),
            chain: engine.local_chain().clone(),
            seq_no,
        };
        engine.broadcast(&ConsensusMessage::from(fetch), &[engine.local_chain()]);
        Event::FetchCommitted(FetchCommittedEvent {
            timestamp: SystemTime::now(),
            seq_no,
        })
        .publish(&engine.event_publisher);
    }
}
