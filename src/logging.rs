/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via
//! [`Options::log_events`](crate::config::Options::log_events).
//!
//! lbft logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed
//! onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [Prepare](crate::events::PrepareEvent) is printed:
//!
//! ```text
//! Prepare, 1701329264, 3f9a0c1, 12, 0, q2x9LmA
//! ```
//!
//! In the snippet:
//! - The third value is the last seven characters of the instance name (the tail of the batch hash).
//! - The fourth value is the sequence number.
//! - The fifth value is the chain the vote was cast on.
//! - The sixth value is the first seven base64 characters of the batch digest.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const PROPOSE: &str = "Propose";
pub const RECEIVE_PRE_PREPARE: &str = "ReceivePrePrepare";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";
pub const PASS_PREPARE: &str = "PassPrepare";
pub const PASS_COMMIT: &str = "PassCommit";
pub const COMMITTED: &str = "Committed";

pub const DELIVER: &str = "Deliver";
pub const FETCH_COMMITTED: &str = "FetchCommitted";

pub const VIEW_CHANGE_VOTE: &str = "ViewChangeVote";
pub const INSTALL_PRIMARY: &str = "InstallPrimary";
pub const INSTANCE_TIMEOUT: &str = "InstanceTimeout";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                short_name(&propose_event.name),
                propose_event.seq_no,
                propose_event.requests
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_pre_prepare_event: &ReceivePrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PRE_PREPARE,
                secs_since_unix_epoch(receive_pre_prepare_event.timestamp),
                receive_pre_prepare_event.origin,
                short_name(&receive_pre_prepare_event.name),
                receive_pre_prepare_event.seq_no,
                receive_pre_prepare_event.chain
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prepare_event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(prepare_event.timestamp),
                short_name(&prepare_event.vote.name),
                prepare_event.vote.seq_no,
                prepare_event.vote.chain,
                first_seven_base64_chars(&prepare_event.vote.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                short_name(&commit_event.vote.name),
                commit_event.vote.seq_no,
                commit_event.vote.chain,
                first_seven_base64_chars(&commit_event.vote.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PassPrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |pass_prepare_event: &PassPrepareEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                PASS_PREPARE,
                secs_since_unix_epoch(pass_prepare_event.timestamp),
                short_name(&pass_prepare_event.name),
                pass_prepare_event.seq_no
            )
        };
        Box::new(logger)
    }
}

impl Logger for PassCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |pass_commit_event: &PassCommitEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                PASS_COMMIT,
                secs_since_unix_epoch(pass_commit_event.timestamp),
                short_name(&pass_commit_event.name),
                pass_commit_event.seq_no
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommittedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |committed_event: &CommittedEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMMITTED,
                secs_since_unix_epoch(committed_event.timestamp),
                short_name(&committed_event.name),
                committed_event.seq_no
            )
        };
        Box::new(logger)
    }
}

impl Logger for DeliverEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |deliver_event: &DeliverEvent| {
            log::info!(
                "{}, {}, {:?}, {}",
                DELIVER,
                secs_since_unix_epoch(deliver_event.timestamp),
                deliver_event.seq_nos,
                deliver_event.transactions
            )
        };
        Box::new(logger)
    }
}

impl Logger for FetchCommittedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |fetch_committed_event: &FetchCommittedEvent| {
            log::info!(
                "{}, {}, {}",
                FETCH_COMMITTED,
                secs_since_unix_epoch(fetch_committed_event.timestamp),
                fetch_committed_event.seq_no
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewChangeVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_change_vote_event: &ViewChangeVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                VIEW_CHANGE_VOTE,
                secs_since_unix_epoch(view_change_vote_event.timestamp),
                view_change_vote_event.view_change.primary_id,
                view_change_vote_event.view_change.h,
                view_change_vote_event.view_change.priority
            )
        };
        Box::new(logger)
    }
}

impl Logger for InstallPrimaryEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |install_primary_event: &InstallPrimaryEvent| {
            log::info!(
                "{}, {}, {}, {}",
                INSTALL_PRIMARY,
                secs_since_unix_epoch(install_primary_event.timestamp),
                install_primary_event.primary,
                install_primary_event.h
            )
        };
        Box::new(logger)
    }
}

impl Logger for InstanceTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |instance_timeout_event: &InstanceTimeoutEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                INSTANCE_TIMEOUT,
                secs_since_unix_epoch(instance_timeout_event.timestamp),
                short_name(&instance_timeout_event.name),
                instance_timeout_event.seq_no
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

// Instance names end with the hex batch hash; its last seven characters are enough to tell them apart in logs.
pub(crate) fn short_name(name: &str) -> &str {
    let cut = name.len().saturating_sub(7);
    name.get(cut..).unwrap_or(name)
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
