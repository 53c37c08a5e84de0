//! Routes client writes to the consensus engine.
//!
//! Only the leader proposes. Any other node answers with
//! [`WriteError::NotLeader`] carrying the leader's address, and the HTTP layer
//! turns that into a redirect; writes are never proxied. A write on the
//! leader is acknowledged once the engine reports it applied locally, or
//! fails after `commit_timeout` with an explicitly unknown outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::command::Command;
use crate::consensus::Consensus;
use crate::error::{ProposeError, WriteError};
use crate::leadership::LeadershipMonitor;

/// Acknowledgement of a committed and locally applied write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub index: u64,
}

pub struct WriteRouter {
    monitor: LeadershipMonitor,
    engine: Arc<dyn Consensus>,
    commit_timeout: Duration,
}

impl WriteRouter {
    pub fn new(
        monitor: LeadershipMonitor,
        engine: Arc<dyn Consensus>,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            monitor,
            engine,
            commit_timeout,
        }
    }

    pub async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<WriteAck, WriteError> {
        self.handle_write(Command::Put { key, value }).await
    }

    pub async fn delete(&self, key: Vec<u8>) -> Result<WriteAck, WriteError> {
        self.handle_write(Command::Delete { key }).await
    }

    pub async fn handle_write(&self, command: Command) -> Result<WriteAck, WriteError> {
        if !self.monitor.is_leader() {
            return Err(self.not_leader());
        }

        // Invalid commands are refused here, before anything reaches the log.
        let payload = command.encode()?;
        let started = Instant::now();
        let proposal = self.engine.propose(payload);

        match tokio::time::timeout(self.commit_timeout, proposal).await {
            Ok(Ok(index)) => {
                debug!(index, elapsed = ?started.elapsed(), "write committed");
                Ok(WriteAck { index })
            }
            Ok(Err(ProposeError::NotLeader)) => Err(self.not_leader()),
            Ok(Err(ProposeError::Superseded { index, term })) => {
                warn!(index, term, "proposal overwritten by a newer leader");
                Err(WriteError::Rejected {
                    reason: format!("entry {index} was overwritten in term {term}"),
                })
            }
            Ok(Err(ProposeError::Stopped)) => Err(WriteError::Rejected {
                reason: "consensus engine is not running".into(),
            }),
            Ok(Err(err)) => Err(WriteError::Engine(err)),
            Err(_) => {
                let elapsed = started.elapsed();
                warn!(?elapsed, "commit not observed in time; outcome unknown");
                Err(WriteError::CommitTimeout { elapsed })
            }
        }
    }

    fn not_leader(&self) -> WriteError {
        WriteError::NotLeader {
            leader: self.monitor.current().leader_address().map(str::to_owned),
        }
    }
}
