//! [`MemPool`], an in-memory implementation of [`Stack`] used in all of the integration tests.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use borsh::{BorshDeserialize, BorshSerialize};
use lbft_rs::{
    stack::{Stack, Transaction},
    types::{ChainID, SeqNo},
};

/// A transfer of `amount` from an account on `from` to an account on `to`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub(crate) struct TransferTx {
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) nonce: u64,
    pub(crate) amount: u64,
    pub(crate) create_time: u64,
}

impl TransferTx {
    pub(crate) fn new(from: &str, to: &str, nonce: u64, amount: u64) -> TransferTx {
        let create_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos() as u64;
        TransferTx {
            from: from.to_string(),
            to: to.to_string(),
            nonce,
            amount,
            create_time,
        }
    }
}

impl Transaction for TransferTx {
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
        self.create_time
    }
}

/// A transaction pool that accepts every well-formed transfer with a non-zero amount.
///
/// Clones share the same pool, so that tests can submit transactions to a pool owned by a replica.
#[derive(Clone, Default)]
pub(crate) struct MemPool {
    pending: Arc<Mutex<Vec<TransferTx>>>,
}

impl MemPool {
    pub(crate) fn new() -> MemPool {
        MemPool::default()
    }

    /// Add `txs` to the pool in one step, so that the primary sees all of them or none.
    pub(crate) fn submit(&self, txs: Vec<TransferTx>) {
        self.pending.lock().unwrap().extend(txs);
    }
}

impl Stack for MemPool {
    type Tx = TransferTx;

    fn new_transaction(&self, bytes: &[u8]) -> Option<TransferTx> {
        TransferTx::try_from_slice(bytes).ok()
    }

    fn verify_txs_in_consensus(&self, txs: Vec<TransferTx>, _is_primary: bool) -> Vec<TransferTx> {
        txs.into_iter().filter(|tx| tx.amount > 0).collect()
    }

    fn get_last_seq_no(&self) -> SeqNo {
        0
    }

    fn iter_transaction(&self, f: &mut dyn FnMut(&TransferTx) -> bool) {
        for tx in self.pending.lock().unwrap().iter() {
            if f(tx) {
                break;
            }
        }
    }

    fn removes(&self, txs: &[TransferTx]) {
        self.pending.lock().unwrap().retain(|tx| !txs.contains(tx));
    }

    fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
