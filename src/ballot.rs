/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Generic quorum counting.
//!
//! A [`Ballot`] records at most one ticket per voter and tallies tickets by their content hash, so
//! that the same logical vote cast by different replicas lands in the same bucket. The content hash
//! is supplied by the [`Ticket`] implementation, which is expected to ignore sender identity.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{Digest, ReplicaID};

/// A value that can be voted for.
pub trait Ticket: Clone {
    /// Hash of the content of the vote, excluding who cast it.
    fn ticket_hash(&self) -> Digest;
}

pub struct Ballot<T: Ticket> {
    inner: RwLock<BallotInner<T>>,
}

struct BallotInner<T> {
    by_voter: HashMap<ReplicaID, (Digest, T)>,
    tally: HashMap<Digest, (usize, T)>,
}

impl<T: Ticket> Ballot<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BallotInner {
                by_voter: HashMap::new(),
                tally: HashMap::new(),
            }),
        }
    }

    /// Record `ticket` as `voter`'s vote. A repeated vote for the same content is ignored; a vote for
    /// different content replaces the voter's earlier vote.
    ///
    /// Returns whether the ballot changed.
    pub fn add(&self, voter: ReplicaID, ticket: T) -> bool {
        let hash = ticket.ticket_hash();
        let mut inner = self.inner.write().unwrap();

        let previous = inner.by_voter.get(&voter).map(|(hash, _)| *hash);
        if let Some(previous) = previous {
            if previous == hash {
                return false;
            }
            if let Some((count, _)) = inner.tally.get_mut(&previous) {
                *count -= 1;
                if *count == 0 {
                    inner.tally.remove(&previous);
                }
            }
        }

        inner
            .tally
            .entry(hash)
            .and_modify(|(count, _)| *count += 1)
            .or_insert_with(|| (1, ticket.clone()));
        inner.by_voter.insert(voter, (hash, ticket));
        true
    }

    /// The highest vote count and the ticket that received it. Ties go to the smaller content hash.
    pub fn voter(&self) -> (usize, Option<T>) {
        let inner = self.inner.read().unwrap();
        inner
            .tally
            .iter()
            .max_by(|(hash_a, (count_a, _)), (hash_b, (count_b, _))| {
                count_a.cmp(count_b).then(hash_b.cmp(hash_a))
            })
            .map(|(_, (count, ticket))| (*count, Some(ticket.clone())))
            .unwrap_or((0, None))
    }

    pub fn voter_by_voter(&self, voter: &ReplicaID) -> Option<T> {
        let inner = self.inner.read().unwrap();
        inner.by_voter.get(voter).map(|(_, ticket)| ticket.clone())
    }

    /// How many voters voted for the same content as `ticket`.
    pub fn voter_by_ticket(&self, ticket: &T) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .tally
            .get(&ticket.ticket_hash())
            .map_or(0, |(count, _)| *count)
    }

    /// Snapshot of `(ticket, count)` for every distinct ticket.
    pub fn iter_ticket(&self) -> Vec<(T, usize)> {
        let inner = self.inner.read().unwrap();
        inner
            .tally
            .values()
            .map(|(count, ticket)| (ticket.clone(), *count))
            .collect()
    }

    /// Snapshot of `(voter, ticket)` for every voter.
    pub fn iter_voter(&self) -> Vec<(ReplicaID, T)> {
        let inner = self.inner.read().unwrap();
        inner
            .by_voter
            .iter()
            .map(|(voter, (_, ticket))| (voter.clone(), ticket.clone()))
            .collect()
    }

    /// Number of distinct voters.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_voter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.by_voter.clear();
        inner.tally.clear();
    }
}

impl<T: Ticket> Default for Ballot<T> {
    fn default() -> Self {
        Self::new()
    }
}
