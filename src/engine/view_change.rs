/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The view change sub-protocol, which replaces an unresponsive primary with a newly agreed one.
//!
//! ## Protocol
//!
//! 1. A replica whose primary is silent for `view_change`, or one of whose instances timed out,
//!    nominates itself: it broadcasts a [`ViewChange`] naming itself, its last committed height `h`,
//!    and a timestamp-derived `priority`.
//! 2. Votes are tallied in a [`Ballot`] keyed by voter. Once `q` distinct replicas have voted, every
//!    replica forgets its primary and joins the view change.
//! 3. A voting replica re-votes for the best nominee it has seen: highest `h`, then lowest
//!    `priority`, then lowest ID.
//! 4. A strict majority agreeing on one `(primary_id, h)` installs that primary.
//!
//! Votes are resent every `resend_view_change` until a primary is installed. Exceeding `k * n`
//! resends is a [`FatalError::ViewChangeExhausted`].

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::ballot::Ballot;
use crate::events::{Event, InstallPrimaryEvent, ViewChangeVoteEvent};
use crate::messages::{ConsensusMessage, NullRequest, ViewChange};
use crate::stack::Stack;
use crate::types::{ReplicaID, SeqNo};

use super::{now_nanos, Engine, FatalError};

pub(crate) struct ViewChanger {
    ballot: Ballot<ViewChange>,
    my_vote: Option<ViewChange>,
    resends: usize,
    // `q` replicas voted: the old primary is forgotten until a new one is installed.
    in_view_change: bool,
    liveness_deadline: Instant,
    resend_deadline: Option<Instant>,
    last_view_change: Option<Instant>,
}

impl ViewChanger {
    pub(crate) fn new<S: Stack>(engine: &Engine<S>) -> ViewChanger {
        ViewChanger {
            ballot: Ballot::new(),
            my_vote: None,
            resends: 0,
            in_view_change: false,
            liveness_deadline: Instant::now() + engine.options.view_change,
            resend_deadline: None,
            last_view_change: None,
        }
    }

    /// The primary showed it is alive: push back the liveness deadline, and withdraw a vote that no
    /// quorum joined.
    pub(crate) fn primary_alive<S: Stack>(&mut self, engine: &Engine<S>) {
        self.liveness_deadline = Instant::now() + engine.options.view_change;
        if !self.in_view_change && self.my_vote.is_some() {
            log::info!("primary is alive, withdrawing view change vote");
            self.my_vote = None;
            self.resend_deadline = None;
            self.resends = 0;
            self.ballot.clear();
        }
    }

    /// Whether enough replicas voted to suspend the current primary.
    pub(crate) fn in_view_change(&self) -> bool {
        self.in_view_change
    }

    /// Whether fewer than `q` replicas voted so far.
    pub(crate) fn below_quorum<S: Stack>(&self, engine: &Engine<S>) -> bool {
        self.ballot.len() < engine.options.quorum()
    }

    /// Drive the liveness and resend timers.
    pub(crate) fn on_tick<S: Stack>(&mut self, engine: &Arc<Engine<S>>) -> Result<(), FatalError> {
        let now = Instant::now();
        if engine.is_primary() {
            self.liveness_deadline = now + engine.options.view_change;
        } else if self.my_vote.is_none() && now >= self.liveness_deadline {
            log::info!("primary {:?} is silent", engine.primary());
            self.start_view_change(engine);
        }

        let Some(resend_deadline) = self.resend_deadline else {
            return Ok(());
        };
        if now < resend_deadline {
            return Ok(());
        }
        self.resends += 1;
        if self.resends > engine.options.max_view_change_resends() {
            return Err(FatalError::ViewChangeExhausted { resends: self.resends });
        }
        if let Some(vote) = &self.my_vote {
            engine.broadcast(&ConsensusMessage::ViewChange(vote.clone()), &[engine.local_chain()]);
        }
        self.resend_deadline = Some(now + engine.options.resend_view_change);
        Ok(())
    }

    pub(crate) fn on_instance_timeout<S: Stack>(
        &mut self,
        engine: &Arc<Engine<S>>,
        name: &str,
        seq_no: SeqNo,
    ) {
        if seq_no <= engine.counters.last_seq_no() {
            return;
        }
        log::info!("instance {} at seq_no {} timed out, starting view change", name, seq_no);
        self.start_view_change(engine);
    }

    /// Nominate ourselves, then adopt the best nominee already known.
    fn start_view_change<S: Stack>(&mut self, engine: &Arc<Engine<S>>) {
        let now = Instant::now();
        if self.my_vote.is_some() {
            return;
        }
        let throttled = self
            .last_view_change
            .is_some_and(|last| now.duration_since(last) < engine.options.view_change_period);
        if engine.primary().is_some() && throttled {
            log::debug!("view change throttled");
            self.liveness_deadline = now + engine.options.view_change;
            return;
        }
        self.last_view_change = Some(now);

        self.cast(engine, self_nomination(engine));
        self.adopt_best(engine);
        self.try_install(engine);
    }

    pub(crate) fn on_vote<S: Stack>(&mut self, engine: &Arc<Engine<S>>, vote: ViewChange) {
        if vote.chain != *engine.local_chain() || vote.replica_id == *engine.me() {
            return;
        }
        // A late resend for the primary we already installed.
        if !self.in_view_change && engine.primary().as_ref() == Some(&vote.primary_id) {
            return;
        }
        if !self.ballot.add(vote.replica_id.clone(), vote) {
            return;
        }

        if !self.in_view_change && !self.below_quorum(engine) {
            log::info!(
                "{} replicas voted for a view change, suspending primary",
                self.ballot.len()
            );
            self.in_view_change = true;
            engine.set_primary(None);
            if self.my_vote.is_none() {
                self.last_view_change = Some(Instant::now());
                self.cast(engine, self_nomination(engine));
            }
        }
        if self.my_vote.is_some() {
            self.adopt_best(engine);
        }
        self.try_install(engine);
    }

    /// Adopt a NullRequest's sender as primary when we know of none and no view change is under
    /// way.
    pub(crate) fn on_null_request<S: Stack>(
        &mut self,
        engine: &Arc<Engine<S>>,
        null_request: &NullRequest,
    ) {
        if null_request.chain != *engine.local_chain()
            || null_request.replica_id != null_request.primary_id
        {
            return;
        }
        match engine.primary() {
            Some(primary) if primary == null_request.primary_id => self.primary_alive(engine),
            None if !self.in_view_change && self.below_quorum(engine) => {
                log::info!(
                    "adopting primary {} announced at h = {}",
                    null_request.primary_id,
                    null_request.h
                );
                engine.set_primary(Some(null_request.primary_id.clone()));
                engine.counters.observe(null_request.h);
                self.primary_alive(engine);
            }
            // We missed the installing votes, but the nominee we vote for is already acting as primary.
            None if self
                .my_vote
                .as_ref()
                .is_some_and(|mine| mine.primary_id == null_request.primary_id) =>
            {
                let h = self.my_vote.as_ref().map(|mine| mine.h).unwrap_or_default();
                self.install(engine, null_request.primary_id.clone(), h);
            }
            _ => log::debug!("ignoring NullRequest from {}", null_request.replica_id),
        }
    }

    fn cast<S: Stack>(&mut self, engine: &Engine<S>, vote: ViewChange) {
        self.ballot.add(engine.me().clone(), vote.clone());
        engine.broadcast(&ConsensusMessage::ViewChange(vote.clone()), &[engine.local_chain()]);
        Event::ViewChangeVote(ViewChangeVoteEvent {
            timestamp: SystemTime::now(),
            view_change: vote.clone(),
        })
        .publish(&engine.event_publisher);
        self.my_vote = Some(vote);
        self.resend_deadline = Some(Instant::now() + engine.options.resend_view_change);
    }

    fn adopt_best<S: Stack>(&mut self, engine: &Engine<S>) {
        let Some(best) = self
            .ballot
            .iter_voter()
            .into_iter()
            .map(|(_, vote)| vote)
            .min_by(rank)
        else {
            return;
        };
        let unchanged = self
            .my_vote
            .as_ref()
            .is_some_and(|mine| mine.primary_id == best.primary_id && mine.h == best.h);
        if unchanged {
            return;
        }
        let vote = ViewChange {
            chain: engine.local_chain().clone(),
            replica_id: engine.me().clone(),
            ..best
        };
        self.cast(engine, vote);
    }

    fn try_install<S: Stack>(&mut self, engine: &Arc<Engine<S>>) {
        let (count, ticket) = self.ballot.voter();
        let Some(winner) = ticket else {
            return;
        };
        if count < engine.options.majority() {
            return;
        }
        self.install(engine, winner.primary_id, winner.h);
    }

    /// Install `primary` at height `h`.
    fn install<S: Stack>(&mut self, engine: &Arc<Engine<S>>, primary: ReplicaID, h: SeqNo) {
        log::info!("installing primary {} at h = {}", primary, h);

        // Instances that reached a commit certificate survive: a peer may depend on them.
        for instance in engine.instances() {
            if instance.is_started() && !instance.is_pass_commit() {
                instance.stop(engine);
            }
        }
        engine.set_primary(Some(primary.clone()));
        engine.counters.reset(h);
        engine.pre_prepare_gate.reset(h);
        engine.commit_gate.reset(h);
        engine.in_flight_txs.lock().unwrap().clear();

        self.ballot.clear();
        self.my_vote = None;
        self.resends = 0;
        self.resend_deadline = None;
        self.in_view_change = false;
        let now = Instant::now();
        self.last_view_change = Some(now);
        self.liveness_deadline = now + engine.options.view_change;

        Event::InstallPrimary(InstallPrimaryEvent {
            timestamp: SystemTime::now(),
            primary,
            h,
        })
        .publish(&engine.event_publisher);
    }
}

fn self_nomination<S: Stack>(engine: &Engine<S>) -> ViewChange {
    ViewChange {
        chain: engine.local_chain().clone(),
        replica_id: engine.me().clone(),
        priority: now_nanos(),
        primary_id: engine.me().clone(),
        h: engine.counters.last_seq_no(),
    }
}

/// Better nominees sort first: highest `h`, then lowest `priority`, then lowest ID.
fn rank(a: &ViewChange, b: &ViewChange) -> Ordering {
    b.h.cmp(&a.h)
        .then(a.priority.cmp(&b.priority))
        .then_with(|| a.primary_id.cmp(&b.primary_id))
}
