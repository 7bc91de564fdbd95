/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" identity and hash types shared by every lbft component.
//!
//! These types follow the newtype pattern. They are sent around and inspected, but have no active
//! behavior of their own.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest as _, Sha256};
use std::fmt::{self, Debug, Display, Formatter};

/// Global sequence number assigned to a request batch by the primary of a chain. `0` means "nothing
/// committed yet".
pub type SeqNo = u64;

/// Identity of a chain (a shard). Fixed for the lifetime of a node.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct ChainID(String);

impl ChainID {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChainID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for ChainID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ChainID({})", self.0)
    }
}

impl From<&str> for ChainID {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identity of a voting member of a chain's consensus group.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize)]
pub struct ReplicaID(String);

impl ReplicaID {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The empty replica ID, carried in messages when the sender knows of no primary.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for ReplicaID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for ReplicaID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaID({})", self.0)
    }
}

impl From<&str> for ReplicaID {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A SHA-256 content hash. Binds Prepare and Commit votes to one specific proposal.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshSerialize, BorshDeserialize,
)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Hash the borsh encoding of `value`.
    pub fn of<T: BorshSerialize>(value: &T) -> Self {
        // Serializing into a Vec cannot fail.
        let bytes = value.try_to_vec().unwrap_or_default();
        Self::of_bytes(&bytes)
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Lowercase hex encoding, used to build instance names.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|byte| format!("{:02x}", byte)).collect()
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..8])
    }
}
