/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! An implementation of the lbft consensus engine: three-phase commit over request batches, with a
//! dual quorum for batches that move value between two chains.
//!
//! Start with [`consenter`], which builds and runs a replica.

pub mod ballot;

pub mod config;

pub mod consenter;

pub(crate) mod engine;

pub(crate) mod event_bus;

pub mod events;

pub(crate) mod instance;

pub mod logging;

pub mod messages;

pub mod seq_gate;

pub mod stack;

pub mod types;

pub use config::{ConfigError, Options};
pub use consenter::{Consenter, Lbft, LbftSpec};
pub use engine::{CommittedTxs, FatalError};
pub use messages::{Broadcast, WireError};
pub use stack::{Stack, Transaction};
