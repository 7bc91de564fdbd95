/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types shared across the lbft components.

pub mod basic;

pub mod request;

pub use basic::{ChainID, Digest, ReplicaID, SeqNo};
pub use request::{BatchError, Request, RequestBatch, EMPTY_BLOCK};
