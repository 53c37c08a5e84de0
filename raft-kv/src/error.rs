//! Error types for every layer of the node.
//!
//! Errors fall into two groups. Request-side errors ([`WriteError`],
//! [`ReadError`], [`CodecError`] before proposing) are returned to the client.
//! Apply-side errors ([`ApplyError`], [`RestoreError`] while installing a
//! leader snapshot) stop the consensus worker, since a replica that skipped a
//! committed entry would silently diverge from the rest of the cluster.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A command could not be encoded, or bytes are not a valid encoded command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("command key must not be empty")]
    EmptyKey,
    #[error("command payload is empty")]
    EmptyPayload,
    #[error("unsupported command format version {0}")]
    UnknownVersion(u8),
    #[error("malformed command payload: {0}")]
    Malformed(String),
}

/// Failure reported by the local key-value store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("store backend failed: {0}")]
    Backend(String),
}

/// Failure while applying a committed entry. Every variant is fatal to the
/// engine worker that delivered the entry.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("entry {index} delivered out of order (last applied {last_applied})")]
    OutOfOrder { index: u64, last_applied: u64 },
    #[error("committed entry {index} is corrupt: {source}")]
    Corrupt { index: u64, source: CodecError },
    #[error("storage failed while applying entry {index}: {source}")]
    Storage { index: u64, source: StorageError },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("reading the store for a snapshot failed: {0}")]
    Storage(#[from] StorageError),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("writing snapshot failed: {0}")]
    Io(#[from] io::Error),
}

/// Failure while restoring from a snapshot. Unless the variant is
/// [`RestoreError::Unrecoverable`], the store still holds its previous contents.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("snapshot decoding failed: {0}")]
    Decode(#[from] bincode::Error),
    #[error("reading snapshot failed: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u8),
    #[error("snapshot contains an empty key")]
    EmptyKey,
    #[error("snapshot contains a duplicate key")]
    DuplicateKey,
    #[error("snapshot has trailing bytes after its last record")]
    TrailingBytes,
    #[error("storage failed during restore: {0}")]
    Storage(#[from] StorageError),
    #[error("storage failed during restore and the previous contents could not be put back: {0}")]
    Unrecoverable(StorageError),
}

/// Failure reported by the consensus engine for a proposal or read-index request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProposeError {
    #[error("this node is not the leader")]
    NotLeader,
    #[error("entry {index} was overwritten by an entry from term {term}")]
    Superseded { index: u64, term: u64 },
    #[error("consensus engine is not running")]
    Stopped,
    #[error("consensus engine dropped the request; outcome unknown")]
    Abandoned,
    #[error("consensus engine rejected the request: {0}")]
    Engine(String),
}

#[derive(Debug, Error)]
pub enum WriteError {
    /// The write must be sent to `leader` instead; `None` while no leader is known.
    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<String> },
    #[error("invalid command: {0}")]
    Invalid(#[from] CodecError),
    /// The proposal may still commit. Callers must not blindly retry.
    #[error("commit not observed within {elapsed:?}; outcome unknown")]
    CommitTimeout { elapsed: Duration },
    /// The proposal will never be applied.
    #[error("write rejected: {reason}")]
    Rejected { reason: String },
    #[error("consensus engine failure: {0}")]
    Engine(ProposeError),
}

impl WriteError {
    /// Whether the write may have been, or may still be, applied.
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            WriteError::CommitTimeout { .. } | WriteError::Engine(ProposeError::Abandoned)
        )
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("strong reads must go to the leader (leader: {leader:?})")]
    NotLeader { leader: Option<String> },
    #[error("read freshness not confirmed within {elapsed:?}")]
    Timeout { elapsed: Duration },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("consensus engine failure: {0}")]
    Engine(ProposeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("invalid peer entry {0:?}, expected ID=RAFT_ADDR/API_ADDR")]
    InvalidPeer(String),
    #[error("node id 0 is reserved")]
    ZeroId,
    #[error("node {0} is listed more than once")]
    DuplicateId(u64),
    #[error("membership must contain at least one node")]
    Empty,
    #[error("node {0} is not part of the membership")]
    UnknownNode(u64),
}
