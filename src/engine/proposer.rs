/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The proposer loop. While this replica is primary it:
//! - cuts request batches from the [`Stack`] every `block_interval`,
//! - proposes an empty block when nothing was proposed for `block_delay`, and
//! - broadcasts a [`NullRequest`] when idle for `null_request`, so that followers can tell an idle
//!   primary from an unreachable one.
//!
//! Every timer restarts when the replica becomes primary.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::messages::{ConsensusMessage, NullRequest};
use crate::stack::{Stack, Transaction};
use crate::types::{ChainID, Digest, RequestBatch};

use super::{now_nanos, Engine, LOOP_POLL_INTERVAL};

pub(crate) struct Proposer<S: Stack> {
    engine: Arc<Engine<S>>,
    shutdown_signal: Receiver<()>,
    was_primary: bool,
    batch_counter: u64,
    next_block: Instant,
    next_empty_block: Instant,
    next_null_request: Instant,
}

impl<S: Stack> Proposer<S> {
    pub(crate) fn new(engine: Arc<Engine<S>>, shutdown_signal: Receiver<()>) -> Self {
        let now = Instant::now();
        Proposer {
            engine,
            shutdown_signal,
            was_primary: false,
            batch_counter: 0,
            next_block: now,
            next_empty_block: now,
            next_null_request: now,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match self.shutdown_signal.recv_timeout(LOOP_POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => (),
            }
            if self.engine.is_halted() {
                return;
            }
            self.tick(Instant::now());
        })
    }

    fn tick(&mut self, now: Instant) {
        let is_primary = self.engine.is_primary();
        if is_primary && !self.was_primary {
            log::info!("{} is primary, starting proposal timers", self.engine.me());
            self.restart_timers(now);
        }
        self.was_primary = is_primary;
        if !is_primary {
            return;
        }

        let options = &self.engine.options;
        if now >= self.next_block {
            let (block_interval, block_delay, null_request) =
                (options.block_interval, options.block_delay, options.null_request);
            if self.originate() > 0 {
                self.next_empty_block = now + block_delay;
                self.next_null_request = now + null_request;
            }
            self.next_block = now + block_interval;
        }

        let options = &self.engine.options;
        if now >= self.next_empty_block {
            let (block_delay, null_request) = (options.block_delay, options.null_request);
            self.engine.propose(RequestBatch::empty_block(now_nanos()));
            self.next_empty_block = now + block_delay;
            self.next_null_request = now + null_request;
        }

        let options = &self.engine.options;
        if now >= self.next_null_request {
            let null_request = NullRequest {
                replica_id: self.engine.me().clone(),
                chain: self.engine.local_chain().clone(),
                primary_id: self.engine.me().clone(),
                h: self.engine.counters.last_seq_no(),
            };
            self.next_null_request = now + options.null_request;
            self.engine.broadcast(
                &ConsensusMessage::NullRequest(null_request),
                &[self.engine.local_chain()],
            );
        }
    }

    fn restart_timers(&mut self, now: Instant) {
        let options = &self.engine.options;
        self.next_block = now + options.block_interval;
        self.next_empty_block = now + options.block_delay;
        self.next_null_request = now;
    }

    /// Cut batches from the pool and propose them. Returns the number of batches proposed.
    ///
    /// At most `max_concurrent_num_from` batches are in flight at once. Each batch holds at most
    /// `block_size` requests, all bound for the same chain.
    fn originate(&mut self) -> usize {
        let engine = &self.engine;
        let options = &engine.options;
        let allowed = options
            .max_concurrent_num_from
            .saturating_sub(engine.counters.in_flight() as usize);
        if allowed == 0 {
            return 0;
        }

        let limit = options.block_size * allowed;
        let mut pulled = Vec::new();
        {
            let in_flight_txs = engine.in_flight_txs.lock().unwrap();
            engine.stack.iter_transaction(&mut |tx| {
                if !in_flight_txs.contains(&tx.hash()) {
                    pulled.push(tx.clone());
                }
                pulled.len() >= limit
            });
        }
        if pulled.is_empty() {
            return 0;
        }

        let accepted = engine.stack.verify_txs_in_consensus(pulled.clone(), true);
        let accepted_hashes: Vec<Digest> = accepted.iter().map(Transaction::hash).collect();
        let rejected: Vec<S::Tx> = pulled
            .into_iter()
            .filter(|tx| !accepted_hashes.contains(&tx.hash()))
            .collect();
        if !rejected.is_empty() {
            log::debug!("removing {} invalid transactions from the pool", rejected.len());
            engine.stack.removes(&rejected);
        }

        // One destination chain per batch.
        let local = engine.local_chain();
        let mut by_destination: BTreeMap<ChainID, Vec<S::Tx>> = BTreeMap::new();
        for tx in accepted {
            if tx.from_chain() == *local {
                by_destination.entry(tx.to_chain()).or_default().push(tx);
            }
        }

        let mut batches = Vec::new();
        'cut: for txs in by_destination.values() {
            for chunk in txs.chunks(options.block_size) {
                if batches.len() >= allowed {
                    break 'cut;
                }
                batches.push(chunk.to_vec());
            }
        }

        let proposed = batches.len();
        for chunk in batches {
            self.batch_counter += 1;
            let id = format!("{}-{}", self.engine.me(), self.batch_counter);
            {
                let mut in_flight_txs = self.engine.in_flight_txs.lock().unwrap();
                in_flight_txs.extend(chunk.iter().map(Transaction::hash));
            }
            let requests = chunk.iter().map(Transaction::to_request).collect();
            self.engine.propose(RequestBatch::new(now_nanos(), requests, id));
        }
        proposed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::engine::testing::*;
    use crate::messages::PrePrepare;

    fn proposer(
        options: crate::config::Options,
    ) -> (Proposer<TestStack>, TestOutputs, mpsc::Sender<()>) {
        let (engine, outputs) = test_engine(options);
        engine.set_primary(Some(engine.me().clone()));
        let (shutdown, shutdown_signal) = mpsc::channel();
        (Proposer::new(engine, shutdown_signal), outputs, shutdown)
    }

    fn proposals(outputs: &TestOutputs) -> Vec<PrePrepare> {
        outputs
            .sent()
            .into_iter()
            .filter_map(|(_, msg)| match msg {
                ConsensusMessage::PrePrepare(pre_prepare) => Some(pre_prepare),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn batches_are_cut_by_size_and_destination() {
        let mut options = options("0", "r0");
        options.block_size = 2;
        let (mut proposer, outputs, _shutdown) = proposer(options);
        let mut invalid = TestTx::local(9);
        invalid.valid = false;
        *proposer.engine.stack.pool.lock().unwrap() = vec![
            TestTx::local(1),
            TestTx::local(2),
            TestTx::local(3),
            TestTx::between("0", "1", 4),
            TestTx::between("1", "0", 5),
            invalid.clone(),
        ];

        assert_eq!(proposer.originate(), 3);
        let sent = outputs.sent();
        let sizes = |chain: &str| -> Vec<(u64, usize)> {
            sent.iter()
                .filter_map(|(to, msg)| match msg {
                    ConsensusMessage::PrePrepare(pre_prepare) if to.as_str() == chain => {
                        Some((pre_prepare.seq_no, pre_prepare.request_batch.requests.len()))
                    }
                    _ => None,
                })
                .collect()
        };
        assert_eq!(sizes("0"), vec![(1, 2), (2, 1), (3, 1)]);
        // Only the cross-chain batch goes to chain 1.
        assert_eq!(sizes("1"), vec![(3, 1)]);
        assert_eq!(*proposer.engine.stack.removed.lock().unwrap(), vec![invalid]);

        // In-flight transactions are not proposed twice.
        assert_eq!(proposer.originate(), 0);
        proposer.engine.stop_instances();
    }

    #[test]
    fn in_flight_batches_are_bounded() {
        let mut options = options("0", "r0");
        options.block_size = 1;
        options.max_concurrent_num_from = 2;
        let (mut proposer, outputs, _shutdown) = proposer(options);
        *proposer.engine.stack.pool.lock().unwrap() =
            (1..=5).map(TestTx::local).collect();

        assert_eq!(proposer.originate(), 2);
        assert_eq!(proposer.originate(), 0);
        assert_eq!(proposals(&outputs).len(), 2);

        proposer.engine.counters.raise_last(1);
        assert_eq!(proposer.originate(), 1);
        proposer.engine.stop_instances();
    }

    #[test]
    fn idle_primary_proposes_empty_blocks_and_null_requests() {
        let mut options = options("0", "r0");
        options.block_delay = Duration::from_millis(10);
        let (mut proposer, outputs, _shutdown) = proposer(options);

        let start = Instant::now();
        proposer.tick(start);
        let first: Vec<&str> = outputs.sent().iter().map(|(_, msg)| msg.kind()).collect();
        assert_eq!(first, vec!["NullRequest"]);

        proposer.tick(start + Duration::from_millis(20));
        let sent = proposals(&outputs);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].request_batch.is_empty_block());
        proposer.engine.stop_instances();
    }

    #[test]
    fn followers_do_not_propose() {
        let (mut proposer, outputs, _shutdown) = proposer(options("0", "r0"));
        proposer.engine.set_primary(Some("r1".into()));
        *proposer.engine.stack.pool.lock().unwrap() = vec![TestTx::local(1)];
        proposer.tick(Instant::now() + Duration::from_secs(60));
        assert!(outputs.sent().is_empty());
    }
}
