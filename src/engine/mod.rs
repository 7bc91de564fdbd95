/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The engine: state shared by the three engine loops and every running instance.
//!
//! ## Threads
//!
//! An lbft replica runs three long-lived engine threads, plus one thread per started
//! [instance](crate::instance):
//! 1. The [dispatch loop](dispatch) demultiplexes consensus messages, routes them to instances, and
//!    runs the [view change](view_change) sub-protocol.
//! 2. The [proposer loop](proposer) cuts batches from the [`Stack`] while this replica is primary,
//!    and keeps followers convinced that an idle primary is alive.
//! 3. The [aggregation loop](checkpoint) collects committed batches into the checkpoint window and
//!    delivers them in sequence order.
//!
//! Each loop owns its own state. What lives in [`Engine`] is the state that more than one thread
//! reads: counters (atomics), ordering gates, the current primary, the instance table, and the
//! checkpoint window.

pub(crate) mod checkpoint;
pub(crate) mod dispatch;
pub(crate) mod proposer;
pub(crate) mod view_change;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::config::Options;
use crate::events::{Event, ProposeEvent};
use crate::instance::Instance;
use crate::messages::{Broadcast, Committed, ConsensusMessage, FetchCommitted, PrePrepare};
use crate::seq_gate::SeqGate;
use crate::stack::Stack;
use crate::types::{ChainID, Digest, ReplicaID, RequestBatch, SeqNo};

/// How long an engine loop blocks on its inbox before re-checking its shutdown signal and timers.
pub(crate) const LOOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A contiguous run of committed batches, delivered to block production.
#[derive(Clone, Debug)]
pub struct CommittedTxs<T> {
    pub seq_nos: Vec<SeqNo>,
    /// Delivery time, in nanoseconds since the Unix epoch.
    pub time: u64,
    pub transactions: Vec<T>,
}

/// A condition under which continuing would silently desynchronize this replica's ledger. The
/// engine stops its loops after reporting one.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FatalError {
    #[error("checkpoint window diverged: seq_no {buffered} is buffered but only {exec_seq_no} is delivered (window {window})")]
    CheckpointDivergence {
        exec_seq_no: SeqNo,
        buffered: SeqNo,
        window: usize,
    },

    #[error("view change did not converge after {resends} resends")]
    ViewChangeExhausted { resends: usize },
}

/// Input of the dispatch loop.
pub(crate) enum DispatchInput {
    Message(ConsensusMessage),
    InstanceTimedOut { name: String, seq_no: SeqNo },
}

/// Input of the aggregation loop.
pub(crate) enum AggregateInput {
    /// A local instance committed.
    Local(Committed),
    /// A peer reported a commit.
    Peer(Committed),
    /// A peer asked for a committed batch.
    Fetch(FetchCommitted),
}

/// Channels through which the engine hands its output to the consenter's owner.
pub(crate) struct EngineOutputs<T> {
    pub(crate) broadcasts: Sender<Broadcast>,
    pub(crate) committed_txs: Sender<CommittedTxs<T>>,
    pub(crate) fatal_errors: Sender<FatalError>,
}

/// The four sequence counters. Every mutation is a single atomic operation.
///
/// `verify_seq_no` drives no decision in the engine. It is reported through
/// [`Lbft::verify_seq_no`](crate::Lbft::verify_seq_no) so that an operator can see how far
/// re-validation runs ahead of delivery.
pub(crate) struct SeqCounters {
    // Highest seq_no known to be committed.
    last_seq_no: AtomicU64,
    // Highest seq_no assigned (by this replica as primary) or observed in a PrePrepare.
    seq_no: AtomicU64,
    // Highest seq_no whose batch passed re-validation.
    verify_seq_no: AtomicU64,
    // Highest seq_no delivered to block production.
    exec_seq_no: AtomicU64,
}

impl SeqCounters {
    pub(crate) fn new(start: SeqNo) -> Self {
        Self {
            last_seq_no: AtomicU64::new(start),
            seq_no: AtomicU64::new(start),
            verify_seq_no: AtomicU64::new(start),
            exec_seq_no: AtomicU64::new(start),
        }
    }

    pub(crate) fn last_seq_no(&self) -> SeqNo {
        self.last_seq_no.load(Ordering::SeqCst)
    }

    pub(crate) fn seq_no(&self) -> SeqNo {
        self.seq_no.load(Ordering::SeqCst)
    }

    pub(crate) fn verify_seq_no(&self) -> SeqNo {
        self.verify_seq_no.load(Ordering::SeqCst)
    }

    pub(crate) fn exec_seq_no(&self) -> SeqNo {
        self.exec_seq_no.load(Ordering::SeqCst)
    }

    pub(crate) fn raise_last(&self, seq_no: SeqNo) {
        self.last_seq_no.fetch_max(seq_no, Ordering::SeqCst);
    }

    /// Assign the next sequence number.
    pub(crate) fn assign(&self) -> SeqNo {
        self.seq_no.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn observe(&self, seq_no: SeqNo) {
        self.seq_no.fetch_max(seq_no, Ordering::SeqCst);
    }

    pub(crate) fn advance_verify(&self, seq_no: SeqNo) {
        self.verify_seq_no.fetch_max(seq_no, Ordering::SeqCst);
    }

    pub(crate) fn set_exec(&self, seq_no: SeqNo) {
        self.exec_seq_no.fetch_max(seq_no, Ordering::SeqCst);
    }

    /// Assigned but not yet committed.
    pub(crate) fn in_flight(&self) -> u64 {
        self.seq_no().saturating_sub(self.last_seq_no())
    }

    /// Move every counter but the delivery point to `h`. Used when a new primary is installed.
    pub(crate) fn reset(&self, h: SeqNo) {
        self.last_seq_no.store(h, Ordering::SeqCst);
        self.seq_no.store(h, Ordering::SeqCst);
        self.verify_seq_no.store(h, Ordering::SeqCst);
    }
}

pub(crate) struct Engine<S: Stack> {
    pub(crate) options: Options,
    pub(crate) stack: S,
    pub(crate) counters: SeqCounters,
    pub(crate) pre_prepare_gate: SeqGate,
    pub(crate) commit_gate: SeqGate,
    primary: RwLock<Option<ReplicaID>>,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    // Names of committed instances, with their seq_no, so that late votes do not recreate them.
    retired: RwLock<HashMap<String, SeqNo>>,
    pub(crate) checkpoint: RwLock<BTreeMap<SeqNo, RequestBatch>>,
    pub(crate) in_flight_txs: Mutex<HashSet<Digest>>,
    halted: AtomicBool,
    outputs: EngineOutputs<S::Tx>,
    dispatch_sender: Sender<DispatchInput>,
    aggregate_sender: Sender<AggregateInput>,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl<S: Stack> Engine<S> {
    /// Create the engine, returning it together with the inboxes of the dispatch and aggregation
    /// loops.
    pub(crate) fn new(
        options: Options,
        stack: S,
        outputs: EngineOutputs<S::Tx>,
        event_publisher: Option<Sender<Event>>,
    ) -> (Arc<Engine<S>>, Receiver<DispatchInput>, Receiver<AggregateInput>) {
        let start = stack.get_last_seq_no();
        let (dispatch_sender, dispatch_inbox) = mpsc::channel();
        let (aggregate_sender, aggregate_inbox) = mpsc::channel();

        let engine = Engine {
            options,
            stack,
            counters: SeqCounters::new(start),
            pre_prepare_gate: SeqGate::new(start),
            commit_gate: SeqGate::new(start),
            primary: RwLock::new(None),
            instances: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
            checkpoint: RwLock::new(BTreeMap::new()),
            in_flight_txs: Mutex::new(HashSet::new()),
            halted: AtomicBool::new(false),
            outputs,
            dispatch_sender,
            aggregate_sender,
            event_publisher,
        };
        (Arc::new(engine), dispatch_inbox, aggregate_inbox)
    }

    pub(crate) fn me(&self) -> &ReplicaID {
        &self.options.id
    }

    pub(crate) fn local_chain(&self) -> &ChainID {
        &self.options.chain
    }

    pub(crate) fn primary(&self) -> Option<ReplicaID> {
        self.primary.read().unwrap().clone()
    }

    pub(crate) fn set_primary(&self, primary: Option<ReplicaID>) {
        *self.primary.write().unwrap() = primary;
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.primary.read().unwrap().as_ref() == Some(self.me())
    }

    /* ↓↓↓ Instance table ↓↓↓ */

    /// Get the instance named `name`, creating it if absent. Returns `None` for names that already
    /// committed.
    pub(crate) fn get_or_create(&self, name: &str) -> Option<Arc<Instance>> {
        if self.is_retired(name) {
            return None;
        }
        if let Some(instance) = self.instances.read().unwrap().get(name) {
            return Some(instance.clone());
        }

        let mut instances = self.instances.write().unwrap();
        let instance = instances
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Instance::new(name.to_string(), self.options.buffer_size)));
        Some(instance.clone())
    }

    pub(crate) fn instance(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.read().unwrap().get(name).cloned()
    }

    pub(crate) fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.read().unwrap().values().cloned().collect()
    }

    /// Remove `instance` from the table, unless the name has since been taken by a newer instance.
    pub(crate) fn remove_instance(&self, instance: &Arc<Instance>) {
        let mut instances = self.instances.write().unwrap();
        if instances
            .get(instance.name())
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            instances.remove(instance.name());
        }
    }

    pub(crate) fn retire(&self, name: &str, seq_no: SeqNo) {
        self.retired.write().unwrap().insert(name.to_string(), seq_no);
    }

    pub(crate) fn is_retired(&self, name: &str) -> bool {
        self.retired.read().unwrap().contains_key(name)
    }

    /// Forget retired names at or below `seq_no`.
    pub(crate) fn prune_retired(&self, seq_no: SeqNo) {
        self.retired.write().unwrap().retain(|_, retired_at| *retired_at > seq_no);
    }

    /// Stop every instance. Used on shutdown.
    pub(crate) fn stop_instances(self: &Arc<Self>) {
        for instance in self.instances() {
            instance.stop(self);
        }
    }

    /* ↓↓↓ Proposal ↓↓↓ */

    /// Assign the next sequence number to `batch`, hand it to its instance, and broadcast the
    /// PrePrepare to every chain the batch touches.
    pub(crate) fn propose(self: &Arc<Self>, batch: RequestBatch) {
        let (name, (from_chain, to_chain)) = match batch.key(self.local_chain()).and_then(|name| {
            batch.chains(self.local_chain()).map(|chains| (name, chains))
        }) {
            Ok(keyed) => keyed,
            Err(err) => {
                log::warn!("not proposing batch {}: {}", batch.id, err);
                return;
            }
        };
        let Some(instance) = self.get_or_create(&name) else {
            log::debug!("not proposing batch {}: already committed", batch.id);
            return;
        };
        if instance.is_started() || instance.seq_no() > 0 {
            log::debug!("not proposing batch {}: already sequenced", batch.id);
            return;
        }

        let seq_no = self.counters.assign();
        let requests = batch.requests.len();
        let pre_prepare = PrePrepare {
            name: name.clone(),
            primary_id: self.me().clone(),
            chain: self.local_chain().clone(),
            replica_id: self.me().clone(),
            seq_no,
            request_batch: batch,
        };

        Event::Propose(ProposeEvent {
            timestamp: SystemTime::now(),
            name,
            seq_no,
            requests,
        })
        .publish(&self.event_publisher);

        let msg = ConsensusMessage::from(pre_prepare);
        self.broadcast(&msg, &[&from_chain, &to_chain]);
        instance.recv_message(msg, self);
    }

    /* ↓↓↓ Outputs ↓↓↓ */

    /// Encode `msg` once and address it to every distinct chain in `chains`.
    pub(crate) fn broadcast(&self, msg: &ConsensusMessage, chains: &[&ChainID]) {
        let payload = msg.encode();
        let mut sent: Vec<&ChainID> = Vec::with_capacity(chains.len());
        for chain in chains {
            if sent.contains(chain) {
                continue;
            }
            sent.push(chain);
            let broadcast = Broadcast {
                to: (*chain).clone(),
                payload: payload.clone(),
            };
            if self.outputs.broadcasts.send(broadcast).is_err() {
                log::debug!("dropping {} to chain {}: transport is gone", msg.kind(), chain);
            }
        }
    }

    pub(crate) fn deliver(&self, committed_txs: CommittedTxs<S::Tx>) {
        if self.outputs.committed_txs.send(committed_txs).is_err() {
            log::warn!("committed transactions dropped: block production is gone");
        }
    }

    pub(crate) fn dispatch(&self, input: DispatchInput) {
        // The dispatch inbox lives as long as the engine.
        let _ = self.dispatch_sender.send(input);
    }

    pub(crate) fn aggregate(&self, input: AggregateInput) {
        let _ = self.aggregate_sender.send(input);
    }

    /// Report `err` to the supervisor and halt every engine loop. Only the first report is sent.
    pub(crate) fn report_fatal(&self, err: FatalError) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        log::error!("{}", err);
        let _ = self.outputs.fatal_errors.send(err);
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Clear a previous halt, so that the loops can be started again.
    pub(crate) fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
        self.pre_prepare_gate.open();
        self.commit_gate.open();
    }
}

/// Nanoseconds since the Unix epoch.
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory [`Stack`] and a channel-backed engine for driving components synchronously.

    use std::sync::mpsc::{self, Receiver};
    use std::sync::{Arc, Mutex};

    use borsh::{BorshDeserialize, BorshSerialize};

    use super::*;
    use crate::stack::Transaction;

    #[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
    pub(crate) struct TestTx {
        pub(crate) from: String,
        pub(crate) to: String,
        pub(crate) nonce: u64,
        pub(crate) valid: bool,
    }

    impl TestTx {
        pub(crate) fn local(nonce: u64) -> TestTx {
            TestTx::between("0", "0", nonce)
        }

        pub(crate) fn between(from: &str, to: &str, nonce: u64) -> TestTx {
            TestTx {
                from: from.into(),
                to: to.into(),
                nonce,
                valid: true,
            }
        }
    }

    impl Transaction for TestTx {
        fn serialize(&self) -> Vec<u8> {
            self.try_to_vec().unwrap()
        }

        fn from_chain(&self) -> ChainID {
            ChainID::new(self.from.clone())
        }

        fn to_chain(&self) -> ChainID {
            ChainID::new(self.to.clone())
        }

        fn nonce(&self) -> u64 {
            self.nonce
        }

        fn create_time(&self) -> u64 {
            self.nonce
        }
    }

    #[derive(Default)]
    pub(crate) struct TestStack {
        pub(crate) pool: Mutex<Vec<TestTx>>,
        pub(crate) removed: Mutex<Vec<TestTx>>,
        // The `is_primary` argument of every `verify_txs_in_consensus` call.
        pub(crate) verified_as_primary: Mutex<Vec<bool>>,
    }

    impl Stack for TestStack {
        type Tx = TestTx;

        fn new_transaction(&self, bytes: &[u8]) -> Option<TestTx> {
            TestTx::try_from_slice(bytes).ok()
        }

        fn verify_txs_in_consensus(&self, txs: Vec<TestTx>, is_primary: bool) -> Vec<TestTx> {
            self.verified_as_primary.lock().unwrap().push(is_primary);
            txs.into_iter().filter(|tx| tx.valid).collect()
        }

        fn get_last_seq_no(&self) -> SeqNo {
            0
        }

        fn iter_transaction(&self, f: &mut dyn FnMut(&TestTx) -> bool) {
            for tx in self.pool.lock().unwrap().iter() {
                if f(tx) {
                    break;
                }
            }
        }

        fn removes(&self, txs: &[TestTx]) {
            self.pool.lock().unwrap().retain(|tx| !txs.contains(tx));
            self.removed.lock().unwrap().extend_from_slice(txs);
        }

        fn len(&self) -> usize {
            self.pool.lock().unwrap().len()
        }
    }

    /// The receiving ends of an engine built by [`test_engine`].
    pub(crate) struct TestOutputs {
        pub(crate) broadcasts: Receiver<Broadcast>,
        pub(crate) committed_txs: Receiver<CommittedTxs<TestTx>>,
        pub(crate) fatal_errors: Receiver<FatalError>,
        pub(crate) dispatch_inbox: Receiver<DispatchInput>,
        pub(crate) aggregate_inbox: Receiver<AggregateInput>,
    }

    impl TestOutputs {
        /// Decode every broadcast sent so far.
        pub(crate) fn sent(&self) -> Vec<(ChainID, ConsensusMessage)> {
            self.broadcasts
                .try_iter()
                .map(|broadcast| {
                    let msg = ConsensusMessage::decode(&broadcast.payload).unwrap();
                    (broadcast.to, msg)
                })
                .collect()
        }
    }

    pub(crate) fn options(chain: &str, id: &str) -> Options {
        Options::builder()
            .chain(chain.into())
            .id(id.into())
            .k(4)
            .log_events(false)
            .build()
            .validate()
            .unwrap()
    }

    pub(crate) fn test_engine(options: Options) -> (Arc<Engine<TestStack>>, TestOutputs) {
        let (broadcasts, broadcasts_receiver) = mpsc::channel();
        let (committed_txs, committed_txs_receiver) = mpsc::channel();
        let (fatal_errors, fatal_errors_receiver) = mpsc::channel();
        let outputs = EngineOutputs {
            broadcasts,
            committed_txs,
            fatal_errors,
        };
        let (engine, dispatch_inbox, aggregate_inbox) =
            Engine::new(options, TestStack::default(), outputs, None);
        (
            engine,
            TestOutputs {
                broadcasts: broadcasts_receiver,
                committed_txs: committed_txs_receiver,
                fatal_errors: fatal_errors_receiver,
                dispatch_inbox,
                aggregate_inbox,
            },
        )
    }

    pub(crate) fn batch_of(txs: &[TestTx], id: &str) -> RequestBatch {
        RequestBatch::new(1, txs.iter().map(|tx| tx.to_request()).collect(), id.into())
    }
}
