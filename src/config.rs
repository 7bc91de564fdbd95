/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Options of an lbft replica.
//!
//! [`Options`] is built with the builder pattern and then checked with [`Options::validate`], which
//! corrects relationships between options that are merely inconsistent (logging a warning for each
//! correction) and refuses configurations that cannot be made safe:
//!
//! ```ignore
//! let options = Options::builder()
//!     .chain(ChainID::new("0"))
//!     .id(ReplicaID::new("r0"))
//!     .n(4)
//!     .q(3)
//!     .block_interval(Duration::from_secs(1))
//!     .build()
//!     .validate()?;
//! ```
//!
//! ## Quorum floor
//!
//! With `n` replicas of which `f` may be faulty, two quorums of size `q` must intersect in a correct
//! replica. lbft enforces `3q + 1 >= 2n` and never uses a quorum smaller than [`MIN_QUORUM`].

use std::time::Duration;

use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::types::{ChainID, ReplicaID};

/// No phase is ever certified by fewer matching votes than this.
pub const MIN_QUORUM: usize = 3;

/// The smallest replica set lbft can run with.
pub const MIN_REPLICAS: usize = 4;

#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building [Options]. On the builder call the following methods to construct
    [Options], then call [Options::validate] on the result.

    Required:
    - `.chain(...)`
    - `.id(...)`

    Every other option has a default.
"))]
pub struct Options {
    #[builder(setter(doc = "Set the chain this replica belongs to. Required."))]
    pub chain: ChainID,
    #[builder(setter(doc = "Set this replica's identity within its chain. Required."))]
    pub id: ReplicaID,
    #[builder(default = 4, setter(doc = "Set the number of replicas in the chain."))]
    pub n: usize,
    #[builder(default = 3, setter(doc = "Set the quorum size."))]
    pub q: usize,
    #[builder(default = 20, setter(doc = "Set the checkpoint window, in sequence numbers."))]
    pub k: usize,
    #[builder(default = 2000, setter(doc = "Set the maximum number of requests in one batch."))]
    pub block_size: usize,
    #[builder(default = Duration::from_secs(10), setter(doc = "Set how often the primary cuts new batches."))]
    pub block_interval: Duration,
    #[builder(default = Duration::from_secs(8), setter(doc = "Set how long an instance may run before it is considered stuck. Forced below `block_interval`."))]
    pub block_timeout: Duration,
    #[builder(default = Duration::from_secs(10), setter(doc = "Set the idle time after which the primary proposes an empty block."))]
    pub block_delay: Duration,
    #[builder(default = Duration::from_secs(5), setter(doc = "Set how long a follower tolerates a silent primary."))]
    pub view_change: Duration,
    #[builder(default = Duration::from_secs(5), setter(doc = "Set how often a view-change vote is resent while the view change is unresolved."))]
    pub resend_view_change: Duration,
    #[builder(default = Duration::from_secs(30), setter(doc = "Set the minimum time between two view changes started by liveness timers."))]
    pub view_change_period: Duration,
    #[builder(default = Duration::from_secs(3), setter(doc = "Set how often an idle primary broadcasts a null request."))]
    pub null_request: Duration,
    #[builder(default = 1024, setter(doc = "Set the capacity of each instance's message queue."))]
    pub buffer_size: usize,
    #[builder(default = 10, setter(doc = "Set the maximum number of locally originated batches in flight."))]
    pub max_concurrent_num_from: usize,
    #[builder(default = 10, setter(doc = "Set the maximum number of incoming cross-chain batches in flight."))]
    pub max_concurrent_num_to: usize,
    #[builder(default = true, setter(doc = "Set whether events are logged through the `log` crate."))]
    pub log_events: bool,
}

impl Options {
    /// Check the options, correcting the ones that can be corrected.
    pub fn validate(mut self) -> Result<Options, ConfigError> {
        if self.n < MIN_REPLICAS {
            return Err(ConfigError::TooFewReplicas { n: self.n });
        }

        let quorum_floor = Self::quorum_floor(self.n);
        if self.q < quorum_floor {
            log::warn!(
                "q = {} is below the BFT floor for n = {}, using {}",
                self.q,
                self.n,
                quorum_floor
            );
            self.q = quorum_floor;
        }
        if self.q > self.n {
            return Err(ConfigError::QuorumExceedsReplicas { q: self.q, n: self.n });
        }

        for (name, value) in [
            ("k", &mut self.k),
            ("block_size", &mut self.block_size),
            ("buffer_size", &mut self.buffer_size),
            ("max_concurrent_num_from", &mut self.max_concurrent_num_from),
            ("max_concurrent_num_to", &mut self.max_concurrent_num_to),
        ] {
            if *value == 0 {
                log::warn!("{} must be positive, using 1", name);
                *value = 1;
            }
        }

        if self.block_timeout >= self.block_interval {
            let corrected = self.block_interval / 2;
            log::warn!(
                "block_timeout {:?} must be below block_interval {:?}, using {:?}",
                self.block_timeout,
                self.block_interval,
                corrected
            );
            self.block_timeout = corrected;
        }
        if self.resend_view_change > self.view_change {
            log::warn!(
                "resend_view_change {:?} exceeds view_change {:?}, using view_change",
                self.resend_view_change,
                self.view_change
            );
            self.resend_view_change = self.view_change;
        }
        if self.null_request >= self.view_change {
            let corrected = self.view_change / 2;
            log::warn!(
                "null_request {:?} must be below view_change {:?}, using {:?}",
                self.null_request,
                self.view_change,
                corrected
            );
            self.null_request = corrected;
        }
        if self.block_interval.is_zero() || self.view_change.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }

        Ok(self)
    }

    /// `max(MIN_QUORUM, ceil((2n - 1) / 3))`, the smallest `q` satisfying `3q + 1 >= 2n`.
    pub fn quorum_floor(n: usize) -> usize {
        let floor = (2 * n).saturating_sub(1).div_ceil(3);
        floor.max(MIN_QUORUM)
    }

    /// The number of matching votes that certifies a phase on this chain.
    pub fn quorum(&self) -> usize {
        self.q.max(MIN_QUORUM)
    }

    /// Strict majority of the replica set.
    pub fn majority(&self) -> usize {
        self.n / 2 + 1
    }

    /// Upper bound on view-change resends before the cluster is declared unable to agree.
    pub fn max_view_change_resends(&self) -> usize {
        self.k * self.n
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("lbft needs at least {} replicas, got {n}", MIN_REPLICAS)]
    TooFewReplicas { n: usize },

    #[error("quorum {q} cannot exceed the replica count {n}")]
    QuorumExceedsReplicas { q: usize, n: usize },

    #[error("block_interval and view_change must be non-zero")]
    ZeroDuration,
}
