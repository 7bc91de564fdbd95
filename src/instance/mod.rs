/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Consensus instances: one three-phase agreement per request batch.
//!
//! An [`Instance`] is a handle to a per-batch actor. Messages for the batch are posted to the
//! instance's mailbox with [`recv_message`](Instance::recv_message). The actor's thread, which runs
//! the protocol in [`core`], is spawned by [`start`](Instance::start) when the first local-chain
//! PrePrepare for the batch arrives. Messages posted before that wait in the mailbox.
//!
//! ## Lifecycle
//!
//! ```text
//! created ──start──▶ running ──▶ pass_pre_prepare ──▶ pass_prepare ──▶ pass_commit ──▶ committed
//!    │                  │                                                                  │
//!    └──────────────────┴────────── timed out / superseded by view change ─────────────────┴──▶ stopped
//! ```
//!
//! [`stop`](Instance::stop) notifies both of the engine's [ordering gates](crate::seq_gate) for the
//! instance's sequence number, so that no successor stays blocked behind an instance that will
//! never finish.

mod core;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::Engine;
use crate::messages::ConsensusMessage;
use crate::stack::Stack;
use crate::types::SeqNo;

use self::core::InstanceCore;

pub(crate) struct Instance {
    name: String,
    mailbox: SyncSender<ConsensusMessage>,
    // Taken by the instance's thread when it starts.
    inbox: Mutex<Option<Receiver<ConsensusMessage>>>,
    seq_no: AtomicU64,
    pass_pre_prepare: AtomicBool,
    pass_prepare: AtomicBool,
    pass_commit: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    created: Instant,
}

impl Instance {
    pub(crate) fn new(name: String, buffer_size: usize) -> Instance {
        let (mailbox, inbox) = mpsc::sync_channel(buffer_size);
        Instance {
            name,
            mailbox,
            inbox: Mutex::new(Some(inbox)),
            seq_no: AtomicU64::new(0),
            pass_pre_prepare: AtomicBool::new(false),
            pass_prepare: AtomicBool::new(false),
            pass_commit: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            created: Instant::now(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Post `msg` to the mailbox, starting the instance if `msg` is a PrePrepare for the local
    /// chain. A full mailbox drops the message.
    pub(crate) fn recv_message<S: Stack>(
        self: &Arc<Self>,
        msg: ConsensusMessage,
        engine: &Arc<Engine<S>>,
    ) {
        if self.is_stopped() {
            return;
        }
        let starts = matches!(
            &msg,
            ConsensusMessage::PrePrepare(pre_prepare) if pre_prepare.chain == *engine.local_chain()
        );

        match self.mailbox.try_send(msg) {
            Ok(()) => (),
            Err(TrySendError::Full(msg)) => {
                log::warn!("instance {} mailbox is full, dropping {}", self.name, msg.kind());
                return;
            }
            Err(TrySendError::Disconnected(_)) => return,
        }

        if starts {
            self.start(engine);
        }
    }

    /// Spawn the instance's thread. Calling `start` on a started or stopped instance does nothing.
    pub(crate) fn start<S: Stack>(self: &Arc<Self>, engine: &Arc<Engine<S>>) {
        if self.is_stopped() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inbox) = self.inbox.lock().unwrap().take() else {
            return;
        };

        let core = InstanceCore::new(self.clone(), engine.clone(), inbox);
        thread::spawn(move || core.run());
    }

    /// Stop the instance. Calling `stop` more than once does nothing.
    pub(crate) fn stop<S: Stack>(self: &Arc<Self>, engine: &Engine<S>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let seq_no = self.seq_no();
        if seq_no > 0 {
            engine.pre_prepare_gate.notify(seq_no);
            engine.commit_gate.notify(seq_no);
        }
        engine.remove_instance(self);
    }

    pub(crate) fn seq_no(&self) -> SeqNo {
        self.seq_no.load(Ordering::SeqCst)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn is_pass_pre_prepare(&self) -> bool {
        self.pass_pre_prepare.load(Ordering::SeqCst)
    }

    pub(crate) fn is_pass_prepare(&self) -> bool {
        self.pass_prepare.load(Ordering::SeqCst)
    }

    pub(crate) fn is_pass_commit(&self) -> bool {
        self.pass_commit.load(Ordering::SeqCst)
    }

    pub(crate) fn age(&self) -> Duration {
        self.created.elapsed()
    }

    fn set_seq_no(&self, seq_no: SeqNo) {
        self.seq_no.store(seq_no, Ordering::SeqCst);
    }

    fn cancelled(&self) -> &AtomicBool {
        &self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::*;
    use crate::messages::PrePrepare;

    #[test]
    fn start_and_stop_are_idempotent() {
        let (engine, _outputs) = test_engine(options("0", "r0"));
        let instance = engine.get_or_create("00aa").unwrap();

        instance.start(&engine);
        instance.start(&engine);
        assert!(instance.is_started());
        assert!(instance.inbox.lock().unwrap().is_none());

        instance.stop(&engine);
        instance.stop(&engine);
        assert!(instance.is_stopped());
        assert!(engine.instance("00aa").is_none());
    }

    #[test]
    fn stop_releases_both_gates_for_its_slot() {
        let (engine, _outputs) = test_engine(options("0", "r0"));
        let instance = engine.get_or_create("00aa").unwrap();
        instance.set_seq_no(1);
        instance.stop(&engine);

        // Slot 2 no longer waits for slot 1.
        let cancelled = AtomicBool::new(false);
        let deadline = Some(Instant::now() + Duration::from_millis(200));
        assert!(engine.pre_prepare_gate.acquire(2, deadline, &cancelled).is_ok());
        assert!(engine.commit_gate.acquire(2, deadline, &cancelled).is_ok());
    }

    #[test]
    fn foreign_messages_wait_in_the_mailbox() {
        let (engine, _outputs) = test_engine(options("1", "r0"));
        let instance = engine.get_or_create("01aa").unwrap();
        let batch = batch_of(&[TestTx::between("0", "1", 1)], "r9-1");
        let foreign = PrePrepare {
            name: "01aa".into(),
            primary_id: "r9".into(),
            chain: "0".into(),
            replica_id: "r9".into(),
            seq_no: 3,
            request_batch: batch,
        };
        instance.recv_message(foreign.into(), &engine);
        assert!(!instance.is_started());
        assert!(instance.inbox.lock().unwrap().is_some());
    }

    #[test]
    fn a_full_mailbox_drops_messages() {
        let mut options = options("0", "r0");
        options.buffer_size = 1;
        let (engine, _outputs) = test_engine(options);
        let instance = engine.get_or_create("00aa").unwrap();
        let nudge = || {
            ConsensusMessage::FetchCommitted(crate::messages::FetchCommitted {
                replica_id: "r1".into(),
                chain: "0".into(),
                seq_no: 1,
            })
        };
        instance.recv_message(nudge(), &engine);
        instance.recv_message(nudge(), &engine);

        let inbox = instance.inbox.lock().unwrap().take().unwrap();
        assert_eq!(inbox.try_iter().count(), 1);
    }
}
