/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definitions for the pluggable transaction pool that lbft orders transactions from.
//!
//! lbft does not store, execute, or validate transactions itself. It pulls pending transactions
//! from a [`Stack`] when the local replica is primary, asks the stack to re-validate every proposed
//! batch before voting for it, and hands committed transactions back to the block-production layer
//! in sequence order.
//!
//! Implementors of `Stack` are expected to be *deterministic* in
//! [`verify_txs_in_consensus`](Stack::verify_txs_in_consensus): two honest replicas given the same
//! transactions in the same sequence order must accept the same subset. A replica whose stack
//! disagrees with the primary's computes a different digest and simply does not vote.

use crate::types::{ChainID, Digest, Request, SeqNo};

/// A transaction as lbft sees it: opaque bytes plus routing fields.
pub trait Transaction: Clone + Send + 'static {
    /// The bytes carried in a [`Request`] and later handed to
    /// [`Stack::new_transaction`] on every replica.
    fn serialize(&self) -> Vec<u8>;

    /// The chain sending value.
    fn from_chain(&self) -> ChainID;

    /// The chain receiving value. Equal to `from_chain` for local transactions.
    fn to_chain(&self) -> ChainID;

    fn nonce(&self) -> u64;

    /// Creation time, in nanoseconds since the Unix epoch.
    fn create_time(&self) -> u64;

    fn hash(&self) -> Digest {
        Digest::of_bytes(&self.serialize())
    }

    /// Wrap the transaction in a [`Request`].
    fn to_request(&self) -> Request {
        Request {
            time: self.create_time(),
            transaction: self.serialize(),
            from_chain: self.from_chain(),
            to_chain: self.to_chain(),
            nonce: self.nonce(),
        }
    }
}

/// The transaction pool and validator that lbft orders transactions from.
pub trait Stack: Send + Sync + 'static {
    type Tx: Transaction;

    /// Deserialize a transaction from the bytes of a [`Request`]. Returns `None` if the bytes do
    /// not encode a transaction.
    fn new_transaction(&self, bytes: &[u8]) -> Option<Self::Tx>;

    /// Return the subset of `txs` that is valid, in the order given.
    ///
    /// Called by the primary when it cuts batches (`is_primary == true`), and by every replica
    /// before it votes for a proposed batch.
    fn verify_txs_in_consensus(&self, txs: Vec<Self::Tx>, is_primary: bool) -> Vec<Self::Tx>;

    /// The sequence number of the last batch the node applied before this engine started.
    fn get_last_seq_no(&self) -> SeqNo;

    /// Visit pending transactions in pool order. Iteration stops when `f` returns `true`.
    fn iter_transaction(&self, f: &mut dyn FnMut(&Self::Tx) -> bool);

    /// Remove transactions from the pool, because they were committed or found invalid.
    fn removes(&self, txs: &[Self::Tx]);

    /// The number of pending transactions.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
