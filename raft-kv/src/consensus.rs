//! The boundary between the request path and the consensus engine.
//!
//! The write router and read server only see [`Consensus`]; the engine
//! delivers committed entries straight into the state machine and reports
//! role changes as an ordered stream of [`LeadershipChange`] values.

use async_trait::async_trait;

use crate::error::ProposeError;

/// The node currently holding write authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub id: u64,
    /// Client-facing address of the leader's API.
    pub address: String,
}

/// One notification on the engine's leadership stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipChange {
    pub is_leader: bool,
    /// The known leader, `None` while an election is in progress.
    pub leader: Option<LeaderInfo>,
}

#[async_trait]
pub trait Consensus: Send + Sync {
    /// Appends `payload` to the replicated log.
    ///
    /// Resolves with the entry's index once it is committed and applied to the
    /// local state machine. Dropping the returned future does not withdraw the
    /// proposal: the engine alone decides its fate.
    async fn propose(&self, payload: Vec<u8>) -> Result<u64, ProposeError>;

    /// Confirms leadership with a quorum and returns the commit index at the
    /// time of the request. Reads that wait for this index to be applied are
    /// linearizable.
    async fn read_index(&self) -> Result<u64, ProposeError>;
}
