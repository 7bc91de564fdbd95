/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The three-phase protocol run by an instance's thread.
//!
//! ## Dual quorum
//!
//! A batch whose `from_chain` equals its `to_chain` certifies a phase with one quorum: `max(q, 3)`
//! votes from the local chain matching `(chain, seq_no, digest)`.
//!
//! A cross-chain batch is ordered independently on both chains, each with its own sequence number.
//! Every replica on either chain broadcasts its votes to both chains, and a phase is certified only
//! when BOTH sides clear their threshold:
//! - the local side as above, and
//! - the foreign side: `max(vote.quorum, 3)` votes from the foreign chain matching
//!   `(chain, digest)`. The foreign sequence number is not checked, since it is assigned by the
//!   foreign primary.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::ballot::Ballot;
use crate::config::MIN_QUORUM;
use crate::engine::{AggregateInput, DispatchInput, Engine, LOOP_POLL_INTERVAL};
use crate::events::*;
use crate::messages::{Committed, ConsensusMessage, PhaseVote, PrePrepare};
use crate::seq_gate::GateError;
use crate::stack::{Stack, Transaction};
use crate::types::{ChainID, Digest, ReplicaID, RequestBatch, SeqNo};

use super::Instance;

/// The local-side proposal an instance agreed to vote for.
struct Proposal {
    primary_id: ReplicaID,
    seq_no: SeqNo,
    digest: Digest,
    from_chain: ChainID,
    to_chain: ChainID,
    batch: RequestBatch,
}

impl Proposal {
    fn foreign_chain(&self, local: &ChainID) -> Option<&ChainID> {
        if self.from_chain == self.to_chain {
            None
        } else if self.from_chain == *local {
            Some(&self.to_chain)
        } else {
            Some(&self.from_chain)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prepare,
    Commit,
}

pub(super) struct InstanceCore<S: Stack> {
    instance: Arc<Instance>,
    engine: Arc<Engine<S>>,
    inbox: Receiver<ConsensusMessage>,
    deadline: Instant,
    proposal: Option<Proposal>,
    prepares: Ballot<PhaseVote>,
    commits: Ballot<PhaseVote>,
    // Votes that arrived before the local PrePrepare.
    parked: Vec<ConsensusMessage>,
    // Re-validation disagreed with the proposer. The instance waits out its timeout.
    failed: bool,
    committed: bool,
}

impl<S: Stack> InstanceCore<S> {
    pub(super) fn new(
        instance: Arc<Instance>,
        engine: Arc<Engine<S>>,
        inbox: Receiver<ConsensusMessage>,
    ) -> Self {
        let deadline = Instant::now() + engine.options.block_timeout;
        InstanceCore {
            instance,
            engine,
            inbox,
            deadline,
            proposal: None,
            prepares: Ballot::new(),
            commits: Ballot::new(),
            parked: Vec::new(),
            failed: false,
            committed: false,
        }
    }

    pub(super) fn run(mut self) {
        loop {
            if self.instance.is_stopped() {
                return;
            }
            if self.committed {
                self.instance.stop(&self.engine);
                return;
            }

            let now = Instant::now();
            if now >= self.deadline {
                self.on_timeout();
                return;
            }

            match self.inbox.recv_timeout((self.deadline - now).min(LOOP_POLL_INTERVAL)) {
                Ok(msg) => self.on_message(msg),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn on_message(&mut self, msg: ConsensusMessage) {
        match msg {
            ConsensusMessage::PrePrepare(pre_prepare) => self.on_pre_prepare(pre_prepare),
            ConsensusMessage::Prepare(vote) => self.on_vote(Phase::Prepare, vote),
            ConsensusMessage::Commit(vote) => self.on_vote(Phase::Commit, vote),
            other => log::debug!("instance {} ignores {}", self.instance.name(), other.kind()),
        }
    }

    fn on_pre_prepare(&mut self, pre_prepare: PrePrepare) {
        let local = self.engine.local_chain().clone();

        Event::ReceivePrePrepare(ReceivePrePrepareEvent {
            timestamp: SystemTime::now(),
            origin: pre_prepare.replica_id.clone(),
            chain: pre_prepare.chain.clone(),
            name: pre_prepare.name.clone(),
            seq_no: pre_prepare.seq_no,
        })
        .publish(&self.engine.event_publisher);

        // The foreign side's proposal carries a foreign sequence number. Its votes are what count.
        if pre_prepare.chain != local || self.proposal.is_some() || self.failed {
            return;
        }

        let batch = pre_prepare.request_batch;
        let (from_chain, to_chain) = match batch.chains(&local) {
            Ok(chains) => chains,
            Err(err) => {
                log::warn!("instance {}: {}", self.instance.name(), err);
                self.failed = true;
                return;
            }
        };
        if batch.key(&local).ok().as_deref() != Some(self.instance.name()) {
            log::warn!("instance {}: PrePrepare names a different batch", self.instance.name());
            self.failed = true;
            return;
        }

        let seq_no = pre_prepare.seq_no;
        self.instance.set_seq_no(seq_no);

        // Re-validate in global seq_no order.
        let turn = match self
            .engine
            .pre_prepare_gate
            .acquire(seq_no, Some(self.deadline), self.instance.cancelled())
        {
            Ok(turn) => turn,
            Err(GateError::Stale { .. }) => {
                log::debug!("instance {}: seq_no {} is stale", self.instance.name(), seq_no);
                self.instance.stop(&self.engine);
                return;
            }
            // Timeout is handled by the run loop, cancellation by the stop flag.
            Err(_) => return,
        };

        let digest = batch.hash();
        if !batch.is_empty_block() && self.revalidate(&batch).hash() != digest {
            log::warn!(
                "instance {}: re-validated batch at seq_no {} differs from the proposal",
                self.instance.name(),
                seq_no
            );
            self.failed = true;
            turn.release();
            return;
        }

        self.engine.counters.advance_verify(seq_no);
        self.engine.counters.observe(seq_no);
        self.proposal = Some(Proposal {
            primary_id: pre_prepare.primary_id,
            seq_no,
            digest,
            from_chain,
            to_chain,
            batch,
        });
        self.instance.pass_pre_prepare.store(true, Ordering::SeqCst);
        turn.release();

        self.cast(Phase::Prepare);
        for parked in std::mem::take(&mut self.parked) {
            self.on_message(parked);
        }
        self.advance();
    }

    /// The batch restricted to the requests the stack accepts.
    fn revalidate(&self, batch: &RequestBatch) -> RequestBatch {
        let mut txs = Vec::with_capacity(batch.requests.len());
        for request in &batch.requests {
            match self.engine.stack.new_transaction(&request.transaction) {
                Some(tx) => txs.push(tx),
                None => {
                    log::debug!("instance {}: undecodable request", self.instance.name());
                }
            }
        }
        let accepted: HashSet<Vec<u8>> = self
            .engine
            .stack
            .verify_txs_in_consensus(txs, self.engine.is_primary())
            .iter()
            .map(Transaction::serialize)
            .collect();
        batch.retain_requests(|request| accepted.contains(&request.transaction))
    }

    fn on_vote(&mut self, phase: Phase, vote: PhaseVote) {
        let Some(proposal) = &self.proposal else {
            if self.parked.len() < self.engine.options.buffer_size {
                self.parked.push(match phase {
                    Phase::Prepare => ConsensusMessage::Prepare(vote),
                    Phase::Commit => ConsensusMessage::Commit(vote),
                });
            }
            return;
        };
        if self.failed || vote.name != self.instance.name() {
            return;
        }

        let local = self.engine.local_chain();
        let matches = if vote.chain == *local {
            vote.seq_no == proposal.seq_no && vote.digest == proposal.digest
        } else if proposal.foreign_chain(local) == Some(&vote.chain) {
            vote.digest == proposal.digest
        } else {
            false
        };
        if !matches {
            log::debug!(
                "instance {}: dropping vote from {} on chain {} (seq_no {}, digest {})",
                self.instance.name(),
                vote.replica_id,
                vote.chain,
                vote.seq_no,
                vote.digest
            );
            return;
        }

        // Replica IDs are only unique within a chain.
        let voter = ReplicaID::new(format!("{}/{}", vote.chain, vote.replica_id));
        match phase {
            Phase::Prepare => self.prepares.add(voter, vote),
            Phase::Commit => self.commits.add(voter, vote),
        };
        self.advance();
    }

    fn advance(&mut self) {
        if !self.instance.is_pass_prepare() && self.certified(&self.prepares) {
            self.instance.pass_prepare.store(true, Ordering::SeqCst);
            self.publish_pass(Phase::Prepare);
            self.cast(Phase::Commit);
        }
        if self.instance.is_pass_prepare()
            && !self.instance.is_pass_commit()
            && self.certified(&self.commits)
        {
            self.instance.pass_commit.store(true, Ordering::SeqCst);
            self.publish_pass(Phase::Commit);
            self.emit();
        }
    }

    fn certified(&self, ballot: &Ballot<PhaseVote>) -> bool {
        let Some(proposal) = &self.proposal else {
            return false;
        };
        let local = self.engine.local_chain();
        let quorum = self.engine.options.quorum();
        let tallies = ballot.iter_ticket();

        let local_side = tallies.iter().any(|(vote, count)| {
            vote.chain == *local
                && vote.seq_no == proposal.seq_no
                && vote.digest == proposal.digest
                && *count >= quorum
        });
        let foreign_side = match proposal.foreign_chain(local) {
            None => true,
            Some(foreign) => tallies.iter().any(|(vote, count)| {
                vote.chain == *foreign
                    && vote.digest == proposal.digest
                    && *count >= (vote.quorum as usize).max(MIN_QUORUM)
            }),
        };
        local_side && foreign_side
    }

    /// Vote in `phase` for the recorded proposal: count the vote and broadcast it to both chains.
    fn cast(&mut self, phase: Phase) {
        let Some(proposal) = &self.proposal else {
            return;
        };
        let vote = PhaseVote {
            name: self.instance.name().to_string(),
            primary_id: proposal.primary_id.clone(),
            chain: self.engine.local_chain().clone(),
            replica_id: self.engine.me().clone(),
            seq_no: proposal.seq_no,
            digest: proposal.digest,
            quorum: self.engine.options.quorum() as u64,
        };
        let voter = ReplicaID::new(format!("{}/{}", vote.chain, vote.replica_id));
        let chains = [&proposal.from_chain, &proposal.to_chain];

        let (msg, event) = match phase {
            Phase::Prepare => {
                self.prepares.add(voter, vote.clone());
                (
                    ConsensusMessage::Prepare(vote.clone()),
                    Event::Prepare(PrepareEvent { timestamp: SystemTime::now(), vote }),
                )
            }
            Phase::Commit => {
                self.commits.add(voter, vote.clone());
                (
                    ConsensusMessage::Commit(vote.clone()),
                    Event::Commit(CommitEvent { timestamp: SystemTime::now(), vote }),
                )
            }
        };
        self.engine.broadcast(&msg, &chains);
        event.publish(&self.engine.event_publisher);
    }

    fn publish_pass(&self, phase: Phase) {
        let name = self.instance.name().to_string();
        let seq_no = self.instance.seq_no();
        let timestamp = SystemTime::now();
        match phase {
            Phase::Prepare => Event::PassPrepare(PassPrepareEvent { timestamp, name, seq_no }),
            Phase::Commit => Event::PassCommit(PassCommitEvent { timestamp, name, seq_no }),
        }
        .publish(&self.engine.event_publisher);
    }

    /// Hand the committed batch to the aggregation loop in global seq_no order, and tell every
    /// chain the batch touches.
    fn emit(&mut self) {
        let Some(proposal) = &self.proposal else {
            return;
        };

        // A slot already passed by the gate was recovered from peers; emitting again is harmless.
        let turn = match self
            .engine
            .commit_gate
            .acquire(proposal.seq_no, None, self.instance.cancelled())
        {
            Ok(turn) => Some(turn),
            Err(GateError::Stale { .. }) => None,
            Err(_) => return,
        };

        let committed = Committed {
            name: self.instance.name().to_string(),
            chain: self.engine.local_chain().clone(),
            replica_id: self.engine.me().clone(),
            seq_no: proposal.seq_no,
            request_batch: proposal.batch.clone(),
        };
        self.engine.aggregate(AggregateInput::Local(committed.clone()));
        self.engine
            .broadcast(&committed.into(), &[&proposal.from_chain, &proposal.to_chain]);

        Event::Committed(CommittedEvent {
            timestamp: SystemTime::now(),
            name: self.instance.name().to_string(),
            seq_no: proposal.seq_no,
        })
        .publish(&self.engine.event_publisher);

        if let Some(turn) = turn {
            turn.release();
        }
        self.committed = true;
    }

    fn on_timeout(&mut self) {
        let seq_no = self.instance.seq_no();
        if !self.instance.is_pass_commit() && seq_no > self.engine.counters.last_seq_no() {
            log::warn!("instance {} at seq_no {} timed out", self.instance.name(), seq_no);
            self.engine.dispatch(DispatchInput::InstanceTimedOut {
                name: self.instance.name().to_string(),
                seq_no,
            });
            Event::InstanceTimeout(InstanceTimeoutEvent {
                timestamp: SystemTime::now(),
                name: self.instance.name().to_string(),
                seq_no,
            })
            .publish(&self.engine.event_publisher);
        }
        self.instance.stop(&self.engine);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::engine::testing::*;

    struct Harness {
        core: InstanceCore<TestStack>,
        outputs: TestOutputs,
        // Kept so the core's inbox stays connected.
        _mailbox: mpsc::Sender<ConsensusMessage>,
    }

    fn harness(chain: &str, name: &str) -> Harness {
        let (engine, outputs) = test_engine(options(chain, "r0"));
        let instance = engine.get_or_create(name).unwrap();
        let (mailbox, inbox) = mpsc::channel();
        Harness {
            core: InstanceCore::new(instance, engine, inbox),
            outputs,
            _mailbox: mailbox,
        }
    }

    fn pre_prepare(chain: &str, seq_no: SeqNo, batch: &RequestBatch) -> PrePrepare {
        PrePrepare {
            name: batch.key(&ChainID::new(chain)).unwrap(),
            primary_id: "r0".into(),
            chain: chain.into(),
            replica_id: "r0".into(),
            seq_no,
            request_batch: batch.clone(),
        }
    }

    fn vote(name: &str, chain: &str, replica: &str, seq_no: SeqNo, digest: Digest) -> PhaseVote {
        PhaseVote {
            name: name.into(),
            primary_id: "r0".into(),
            chain: chain.into(),
            replica_id: replica.into(),
            seq_no,
            digest,
            quorum: 3,
        }
    }

    #[test]
    fn local_batch_walks_through_all_phases_in_order() {
        let batch = batch_of(&[TestTx::local(1), TestTx::local(2)], "r0-1");
        let name = batch.key(&"0".into()).unwrap();
        let mut h = harness("0", &name);
        let digest = batch.hash();

        h.core.on_message(pre_prepare("0", 1, &batch).into());
        assert!(h.core.instance.is_pass_pre_prepare());
        assert!(!h.core.instance.is_pass_prepare());
        assert_eq!(h.core.engine.counters.verify_seq_no(), 1);

        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "0", "r1", 1, digest)));
        assert!(!h.core.instance.is_pass_prepare());
        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "0", "r2", 1, digest)));
        assert!(h.core.instance.is_pass_prepare());
        assert!(!h.core.instance.is_pass_commit());

        h.core.on_message(ConsensusMessage::Commit(vote(&name, "0", "r1", 1, digest)));
        h.core.on_message(ConsensusMessage::Commit(vote(&name, "0", "r3", 1, digest)));
        assert!(h.core.instance.is_pass_commit());
        assert!(h.core.committed);

        match h.outputs.aggregate_inbox.try_recv() {
            Ok(AggregateInput::Local(committed)) => {
                assert_eq!(committed.seq_no, 1);
                assert_eq!(committed.request_batch, batch);
            }
            _ => panic!("expected a local Committed"),
        }
        let kinds: Vec<&str> = h.outputs.sent().iter().map(|(_, msg)| msg.kind()).collect();
        assert_eq!(kinds, vec!["Prepare", "Commit", "Committed"]);
    }

    #[test]
    fn revalidation_reports_the_replica_role() {
        let batch = batch_of(&[TestTx::local(1)], "r0-1");
        let name = batch.key(&"0".into()).unwrap();

        let mut primary = harness("0", &name);
        primary.core.engine.set_primary(Some("r0".into()));
        primary.core.on_message(pre_prepare("0", 1, &batch).into());
        assert!(primary.core.instance.is_pass_pre_prepare());
        assert_eq!(*primary.core.engine.stack.verified_as_primary.lock().unwrap(), vec![true]);

        let mut follower = harness("0", &name);
        follower.core.engine.set_primary(Some("r1".into()));
        follower.core.on_message(pre_prepare("0", 1, &batch).into());
        assert!(follower.core.instance.is_pass_pre_prepare());
        assert_eq!(*follower.core.engine.stack.verified_as_primary.lock().unwrap(), vec![false]);
    }

    #[test]
    fn commits_do_not_count_before_prepare_passes() {
        let batch = batch_of(&[TestTx::local(1)], "r0-1");
        let name = batch.key(&"0".into()).unwrap();
        let mut h = harness("0", &name);
        let digest = batch.hash();

        h.core.on_message(pre_prepare("0", 1, &batch).into());
        for replica in ["r1", "r2", "r3"] {
            h.core.on_message(ConsensusMessage::Commit(vote(&name, "0", replica, 1, digest)));
        }
        assert!(!h.core.instance.is_pass_commit());

        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "0", "r1", 1, digest)));
        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "0", "r2", 1, digest)));
        // Prepare passes, and our own Commit joins the three already counted.
        assert!(h.core.instance.is_pass_prepare());
        assert!(h.core.instance.is_pass_commit());
    }

    #[test]
    fn forged_digest_parked_before_pre_prepare_is_rejected() {
        let batch = batch_of(&[TestTx::local(1)], "r0-1");
        let name = batch.key(&"0".into()).unwrap();
        let mut h = harness("0", &name);
        let forged = Digest::of_bytes(b"forged");

        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "0", "r3", 1, forged)));
        assert_eq!(h.core.parked.len(), 1);

        h.core.on_message(pre_prepare("0", 1, &batch).into());
        assert!(h.core.parked.is_empty());
        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "0", "r2", 1, batch.hash())));
        // Ours and r2's: the forged vote did not count.
        assert!(!h.core.instance.is_pass_prepare());
    }

    #[test]
    fn invalid_transactions_fail_closed() {
        let mut bad = TestTx::local(2);
        bad.valid = false;
        let batch = batch_of(&[TestTx::local(1), bad], "r0-1");
        let name = batch.key(&"0".into()).unwrap();
        let mut h = harness("0", &name);

        h.core.on_message(pre_prepare("0", 1, &batch).into());
        assert!(h.core.failed);
        assert!(!h.core.instance.is_pass_pre_prepare());
        assert!(h.outputs.sent().is_empty());
        // The gate slot was released for the successor.
        assert_eq!(h.core.engine.pre_prepare_gate.start(), 1);
    }

    #[test]
    fn cross_chain_batch_needs_both_quorums() {
        let batch = batch_of(&[TestTx::between("0", "1", 1)], "r0-1");
        let name = batch.key(&"0".into()).unwrap();
        let mut h = harness("0", &name);
        let digest = batch.hash();

        h.core.on_message(pre_prepare("0", 5, &batch).into());

        // The local quorum alone is not enough.
        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "0", "r1", 5, digest)));
        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "0", "r2", 5, digest)));
        assert!(!h.core.instance.is_pass_prepare());

        // Foreign votes carry the foreign chain's seq_no. Replica IDs may repeat across chains.
        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "1", "r0", 9, digest)));
        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "1", "r1", 9, digest)));
        assert!(!h.core.instance.is_pass_prepare());
        h.core.on_message(ConsensusMessage::Prepare(vote(&name, "1", "r2", 9, digest)));
        assert!(h.core.instance.is_pass_prepare());

        // Votes from an unrelated chain never count.
        h.core.on_message(ConsensusMessage::Commit(vote(&name, "7", "r1", 5, digest)));
        assert_eq!(h.core.commits.len(), 1);

        let chains: Vec<ChainID> = h.outputs.sent().into_iter().map(|(to, _)| to).collect();
        assert!(chains.contains(&ChainID::new("0")));
        assert!(chains.contains(&ChainID::new("1")));
    }

    #[test]
    fn foreign_pre_prepare_does_not_start_the_protocol() {
        let batch = batch_of(&[TestTx::between("0", "1", 1)], "r9-1");
        let name = batch.key(&"1".into()).unwrap();
        let mut h = harness("1", &name);

        let mut foreign = pre_prepare("0", 4, &batch);
        foreign.name = name.clone();
        h.core.on_message(foreign.into());
        assert!(h.core.proposal.is_none());
        assert!(!h.core.instance.is_pass_pre_prepare());
    }

    #[test]
    fn timeout_reports_to_the_dispatcher_unless_stale() {
        let batch = batch_of(&[TestTx::local(1)], "r0-1");
        let name = batch.key(&"0".into()).unwrap();
        let mut h = harness("0", &name);
        h.core.on_message(pre_prepare("0", 1, &batch).into());

        h.core.on_timeout();
        assert!(h.core.instance.is_stopped());
        assert!(matches!(
            h.outputs.dispatch_inbox.try_recv(),
            Ok(DispatchInput::InstanceTimedOut { seq_no: 1, .. })
        ));

        let batch = batch_of(&[TestTx::local(2)], "r0-2");
        let name = batch.key(&"0".into()).unwrap();
        let mut h = harness("0", &name);
        h.core.on_message(pre_prepare("0", 1, &batch).into());
        h.core.engine.counters.raise_last(1);
        h.core.on_timeout();
        assert!(h.outputs.dispatch_inbox.try_recv().is_err());
    }
}
