/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! An ordering gate that forces concurrently running instances to perform one designated step in
//! strict sequence-number order.
//!
//! Every consensus instance runs on its own thread, and instances complete their quorums in any
//! order. Two steps must nonetheless happen in global sequence order: re-validating a batch's
//! transactions against the pool, and emitting the batch to the delivery pipeline. The engine keeps
//! one [`SeqGate`] for each of these steps.
//!
//! ## Contract
//!
//! 1. [`acquire(s)`](SeqGate::acquire) blocks until slot `s - 1` is done and returns a
//!    [`GateTurn`]. If `s` is the first slot after the gate's start, it returns immediately.
//! 2. Releasing (or dropping) the `GateTurn` marks `s` done, letting `s + 1` proceed.
//! 3. [`notify(s)`](SeqGate::notify) marks `s` done with no turn held. Stopped instances use this so
//!    that no successor waits forever on them.
//! 4. [`notify_all(s)`](SeqGate::notify_all) marks every slot up to `s` done.
//!
//! The gate never goes backward, except through an explicit [`reset`](SeqGate::reset) during view
//! change.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::types::SeqNo;

/// How often a blocked waiter re-checks its cancellation flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct SeqGate {
    state: Mutex<GateState>,
    turn_done: Condvar,
}

struct GateState {
    // Every slot <= start is done.
    start: SeqNo,
    // Done slots above start, waiting for the slots before them.
    done: BTreeSet<SeqNo>,
    closed: bool,
}

impl GateState {
    fn is_done(&self, seq_no: SeqNo) -> bool {
        seq_no <= self.start || self.done.contains(&seq_no)
    }

    fn mark_done(&mut self, seq_no: SeqNo) {
        if seq_no <= self.start {
            return;
        }
        self.done.insert(seq_no);
        while self.done.remove(&(self.start + 1)) {
            self.start += 1;
        }
    }
}

impl SeqGate {
    /// Create a gate whose first turn is `start + 1`.
    pub fn new(start: SeqNo) -> Self {
        Self {
            state: Mutex::new(GateState {
                start,
                done: BTreeSet::new(),
                closed: false,
            }),
            turn_done: Condvar::new(),
        }
    }

    /// Block until it is `seq_no`'s turn.
    ///
    /// Gives up with [`GateError::Timeout`] at `deadline`, or with [`GateError::Cancelled`] soon after
    /// `cancelled` becomes true.
    pub fn acquire(
        &self,
        seq_no: SeqNo,
        deadline: Option<Instant>,
        cancelled: &AtomicBool,
    ) -> Result<GateTurn<'_>, GateError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(GateError::Closed);
            }
            if seq_no <= state.start {
                return Err(GateError::Stale {
                    seq_no,
                    start: state.start,
                });
            }
            if state.is_done(seq_no - 1) {
                return Ok(GateTurn {
                    gate: self,
                    seq_no,
                    released: false,
                });
            }
            if cancelled.load(Ordering::Acquire) {
                return Err(GateError::Cancelled);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(GateError::Timeout { seq_no });
                    }
                    (deadline - now).min(CANCEL_POLL_INTERVAL)
                }
                None => CANCEL_POLL_INTERVAL,
            };
            state = self.turn_done.wait_timeout(state, wait).unwrap().0;
        }
    }

    /// Mark `seq_no` done without holding its turn.
    pub fn notify(&self, seq_no: SeqNo) {
        self.state.lock().unwrap().mark_done(seq_no);
        self.turn_done.notify_all();
    }

    /// Mark every slot up to and including `seq_no` done.
    pub fn notify_all(&self, seq_no: SeqNo) {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<SeqNo> = (state.start + 1..=seq_no).collect();
        for slot in pending {
            state.mark_done(slot);
        }
        drop(state);
        self.turn_done.notify_all();
    }

    /// Restart the gate so that the next turn is `start + 1`. Marks left by discarded instances are
    /// forgotten.
    pub fn reset(&self, start: SeqNo) {
        let mut state = self.state.lock().unwrap();
        state.start = start;
        state.done.clear();
        drop(state);
        self.turn_done.notify_all();
    }

    /// Wake every waiter with [`GateError::Closed`]. Used on engine shutdown.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.turn_done.notify_all();
    }

    /// Reopen a closed gate.
    pub fn open(&self) {
        self.state.lock().unwrap().closed = false;
    }

    /// The highest slot below which every slot is done.
    pub fn start(&self) -> SeqNo {
        self.state.lock().unwrap().start
    }
}

/// Proof that it is a particular sequence number's turn. Marks the slot done when dropped.
pub struct GateTurn<'a> {
    gate: &'a SeqGate,
    seq_no: SeqNo,
    released: bool,
}

impl GateTurn<'_> {
    pub fn seq_no(&self) -> SeqNo {
        self.seq_no
    }

    pub fn release(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.notify(self.seq_no);
        }
    }
}

impl Drop for GateTurn<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("sequence number {seq_no} is at or below the gate start {start}")]
    Stale { seq_no: SeqNo, start: SeqNo },

    #[error("timed out waiting for the turn of sequence number {seq_no}")]
    Timeout { seq_no: SeqNo },

    #[error("waiter was cancelled")]
    Cancelled,

    #[error("gate closed")]
    Closed,
}
