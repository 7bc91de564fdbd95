/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Requests and request batches: the unit of ordering in lbft.
//!
//! A [`RequestBatch`] is certified as a whole by one consensus instance. Every request in a batch
//! moves value from the same sending chain to the same receiving chain, so a batch has exactly one
//! [`from_chain`](RequestBatch::chains) and one `to_chain`. When the two differ the batch is a
//! *cross-chain* batch and needs a quorum on both chains before it commits.

use std::cmp::Ordering;

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use super::basic::{ChainID, Digest};

/// Id of the sentinel batch the primary proposes to keep block production moving when idle.
pub const EMPTY_BLOCK: &str = "EMPTYBLOCK";

/// One serialized transaction, plus the routing fields lbft needs without decoding it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Request {
    pub time: u64,
    pub transaction: Vec<u8>,
    pub from_chain: ChainID,
    pub to_chain: ChainID,
    pub nonce: u64,
}

impl Request {
    pub fn hash(&self) -> Digest {
        Digest::of(self)
    }
}

// Deterministic tie-break so that every replica orders a batch's requests identically.
impl Ord for Request {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nonce
            .cmp(&other.nonce)
            .then(self.time.cmp(&other.time))
            .then_with(|| self.hash().cmp(&other.hash()))
    }
}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestBatch {
    pub time: u64,
    pub requests: Vec<Request>,
    pub id: String,
}

impl RequestBatch {
    pub fn new(time: u64, mut requests: Vec<Request>, id: String) -> Self {
        requests.sort();
        Self { time, requests, id }
    }

    pub fn empty_block(time: u64) -> Self {
        Self {
            time,
            requests: Vec::new(),
            id: EMPTY_BLOCK.to_string(),
        }
    }

    pub fn is_empty_block(&self) -> bool {
        self.id == EMPTY_BLOCK
    }

    /// The digest that Prepare and Commit votes for this batch carry.
    pub fn hash(&self) -> Digest {
        Digest::of(self)
    }

    /// Derive the `(from_chain, to_chain)` pair of the batch. The empty block belongs to `local` on
    /// both sides.
    pub fn chains(&self, local: &ChainID) -> Result<(ChainID, ChainID), BatchError> {
        if self.is_empty_block() {
            return Ok((local.clone(), local.clone()));
        }

        let first = self.requests.first().ok_or(BatchError::Empty)?;
        for request in &self.requests[1..] {
            if request.from_chain != first.from_chain || request.to_chain != first.to_chain {
                return Err(BatchError::MixedChains {
                    id: self.id.clone(),
                });
            }
        }
        Ok((first.from_chain.clone(), first.to_chain.clone()))
    }

    /// The instance name: `from_chain + to_chain + hash(batch)`.
    pub fn key(&self, local: &ChainID) -> Result<String, BatchError> {
        let (from, to) = self.chains(local)?;
        Ok(format!("{}{}{}", from, to, self.hash().to_hex()))
    }

    /// A copy of this batch holding only the requests accepted by `keep`, with order preserved.
    pub(crate) fn retain_requests(&self, keep: impl Fn(&Request) -> bool) -> RequestBatch {
        RequestBatch {
            time: self.time,
            requests: self.requests.iter().filter(|r| keep(r)).cloned().collect(),
            id: self.id.clone(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("request batch {id} mixes requests for different chain pairs")]
    MixedChains { id: String },

    #[error("request batch carries no requests")]
    Empty,
}
