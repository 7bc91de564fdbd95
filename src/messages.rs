/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the structured messages that replicas exchange as part of lbft, and their wire
//! encoding.
//!
//! Every message travels in one envelope, [`ConsensusMessage`], encoded with borsh. The transport is
//! an external collaborator: the engine hands out [`Broadcast`] values holding an encoded envelope
//! and the chain it is addressed to, and accepts encoded envelopes through
//! [`recv_consensus`](crate::consenter::Consenter::recv_consensus).
//!
//! ## Replay-safe hashing
//!
//! Votes are tallied in [ballots](crate::ballot::Ballot) by content. Before hashing, each vote kind
//! clears the fields that identify its sender or that legitimately differ between honest senders
//! (see [`ConsensusMessage::stripped_hash`]), so that the same logical vote from different replicas
//! hashes identically.

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use crate::ballot::Ticket;
use crate::types::{ChainID, Digest, ReplicaID, RequestBatch, SeqNo};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ConsensusMessage {
    RequestBatch(RequestBatch),
    PrePrepare(PrePrepare),
    Prepare(PhaseVote),
    Commit(PhaseVote),
    Committed(Committed),
    ViewChange(ViewChange),
    NullRequest(NullRequest),
    FetchCommitted(FetchCommitted),
}

impl ConsensusMessage {
    pub fn encode(&self) -> Vec<u8> {
        // Serializing into a Vec cannot fail.
        self.try_to_vec().unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Self::try_from_slice(payload).map_err(|err| WireError::Decode(err.to_string()))
    }

    /// Name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::RequestBatch(_) => "RequestBatch",
            ConsensusMessage::PrePrepare(_) => "PrePrepare",
            ConsensusMessage::Prepare(_) => "Prepare",
            ConsensusMessage::Commit(_) => "Commit",
            ConsensusMessage::Committed(_) => "Committed",
            ConsensusMessage::ViewChange(_) => "ViewChange",
            ConsensusMessage::NullRequest(_) => "NullRequest",
            ConsensusMessage::FetchCommitted(_) => "FetchCommitted",
        }
    }

    /// Hash of the message with its sender identity and volatile fields cleared.
    ///
    /// - Prepare / Commit: `replica_id` and `primary_id`.
    /// - Committed: `replica_id`.
    /// - ViewChange: `replica_id` and `priority`.
    /// - Every other kind is hashed as is.
    pub fn stripped_hash(&self) -> Digest {
        match self {
            ConsensusMessage::Prepare(vote) => {
                Digest::of(&ConsensusMessage::Prepare(vote.stripped()))
            }
            ConsensusMessage::Commit(vote) => {
                Digest::of(&ConsensusMessage::Commit(vote.stripped()))
            }
            ConsensusMessage::Committed(committed) => {
                let mut committed = committed.clone();
                committed.replica_id = ReplicaID::default();
                Digest::of(&ConsensusMessage::Committed(committed))
            }
            ConsensusMessage::ViewChange(view_change) => {
                let mut view_change = view_change.clone();
                view_change.replica_id = ReplicaID::default();
                view_change.priority = 0;
                Digest::of(&ConsensusMessage::ViewChange(view_change))
            }
            other => Digest::of(other),
        }
    }
}

impl From<PrePrepare> for ConsensusMessage {
    fn from(pre_prepare: PrePrepare) -> Self {
        ConsensusMessage::PrePrepare(pre_prepare)
    }
}

impl From<Committed> for ConsensusMessage {
    fn from(committed: Committed) -> Self {
        ConsensusMessage::Committed(committed)
    }
}

impl From<ViewChange> for ConsensusMessage {
    fn from(view_change: ViewChange) -> Self {
        ConsensusMessage::ViewChange(view_change)
    }
}

impl From<NullRequest> for ConsensusMessage {
    fn from(null_request: NullRequest) -> Self {
        ConsensusMessage::NullRequest(null_request)
    }
}

impl From<FetchCommitted> for ConsensusMessage {
    fn from(fetch: FetchCommitted) -> Self {
        ConsensusMessage::FetchCommitted(fetch)
    }
}

/// The primary's proposal of a request batch at a sequence number.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepare {
    pub name: String,
    pub primary_id: ReplicaID,
    pub chain: ChainID,
    pub replica_id: ReplicaID,
    pub seq_no: SeqNo,
    pub request_batch: RequestBatch,
}

/// The body of both Prepare and Commit messages.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PhaseVote {
    pub name: String,
    pub primary_id: ReplicaID,
    pub chain: ChainID,
    pub replica_id: ReplicaID,
    pub seq_no: SeqNo,
    pub digest: Digest,
    /// The quorum size of the sender's chain.
    pub quorum: u64,
}

impl PhaseVote {
    fn stripped(&self) -> PhaseVote {
        PhaseVote {
            replica_id: ReplicaID::default(),
            primary_id: ReplicaID::default(),
            ..self.clone()
        }
    }
}

impl Ticket for PhaseVote {
    fn ticket_hash(&self) -> Digest {
        Digest::of(&self.stripped())
    }
}

/// A replica's report that a batch committed at `seq_no` on `chain`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Committed {
    pub name: String,
    pub chain: ChainID,
    pub replica_id: ReplicaID,
    pub seq_no: SeqNo,
    pub request_batch: RequestBatch,
}

impl Ticket for Committed {
    fn ticket_hash(&self) -> Digest {
        ConsensusMessage::Committed(self.clone()).stripped_hash()
    }
}

/// A vote to install `primary_id`, whose last committed height is `h`, as the chain's primary.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChange {
    pub chain: ChainID,
    pub replica_id: ReplicaID,
    /// Tie-break between nominees with equal `h`. Lower wins.
    pub priority: u64,
    pub primary_id: ReplicaID,
    pub h: SeqNo,
}

impl Ticket for ViewChange {
    fn ticket_hash(&self) -> Digest {
        ConsensusMessage::ViewChange(self.clone()).stripped_hash()
    }
}

/// Keepalive from an idle primary, carrying its last committed height.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NullRequest {
    pub replica_id: ReplicaID,
    pub chain: ChainID,
    pub primary_id: ReplicaID,
    pub h: SeqNo,
}

/// A request for the batch committed at `seq_no` on `chain`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FetchCommitted {
    pub replica_id: ReplicaID,
    pub chain: ChainID,
    pub seq_no: SeqNo,
}

/// An encoded message addressed to every replica of one chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broadcast {
    pub to: ChainID,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("cannot decode consensus message: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Request;

    fn vote(replica: &str, primary: &str, seq_no: SeqNo) -> PhaseVote {
        PhaseVote {
            name: "00abc".into(),
            primary_id: primary.into(),
            chain: "0".into(),
            replica_id: replica.into(),
            seq_no,
            digest: Digest::of_bytes(b"batch"),
            quorum: 3,
        }
    }

    #[test]
    fn votes_from_different_senders_hash_identically() {
        let a = ConsensusMessage::Prepare(vote("r1", "r0", 4));
        let b = ConsensusMessage::Prepare(vote("r2", "r9", 4));
        assert_eq!(a.stripped_hash(), b.stripped_hash());
        assert_eq!(vote("r1", "r0", 4).ticket_hash(), vote("r3", "", 4).ticket_hash());

        // Different content still differs.
        let c = ConsensusMessage::Prepare(vote("r1", "r0", 5));
        assert_ne!(a.stripped_hash(), c.stripped_hash());

        // A Commit is not a Prepare.
        let d = ConsensusMessage::Commit(vote("r1", "r0", 4));
        assert_ne!(a.stripped_hash(), d.stripped_hash());
    }

    #[test]
    fn view_change_ticket_ignores_voter_and_priority() {
        let a = ViewChange {
            chain: "0".into(),
            replica_id: "r1".into(),
            priority: 10,
            primary_id: "r2".into(),
            h: 7,
        };
        let b = ViewChange {
            replica_id: "r3".into(),
            priority: 99,
            ..a.clone()
        };
        let c = ViewChange { h: 8, ..a.clone() };
        assert_eq!(a.ticket_hash(), b.ticket_hash());
        assert_ne!(a.ticket_hash(), c.ticket_hash());
    }

    #[test]
    fn envelope_survives_the_wire() {
        let batch = RequestBatch::new(
            3,
            vec![Request {
                time: 3,
                transaction: vec![1, 2, 3],
                from_chain: "0".into(),
                to_chain: "1".into(),
                nonce: 1,
            }],
            "r0-1".into(),
        );
        let msg = ConsensusMessage::PrePrepare(PrePrepare {
            name: batch.key(&"0".into()).unwrap(),
            primary_id: "r0".into(),
            chain: "0".into(),
            replica_id: "r0".into(),
            seq_no: 1,
            request_batch: batch,
        });
        assert_eq!(ConsensusMessage::decode(&msg.encode()), Ok(msg));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            ConsensusMessage::decode(&[0xff, 0x01]),
            Err(WireError::Decode(_))
        ));
    }
}
