//! Serves reads from the local state machine.
//!
//! [`Consistency::Local`] reads whatever this node has applied, which may lag
//! the cluster on a follower. [`Consistency::Strong`] first has the leader
//! confirm its leadership and obtain a read index, then waits until that
//! index is applied locally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::consensus::Consensus;
use crate::error::{ProposeError, ReadError};
use crate::leadership::LeadershipMonitor;
use crate::state_machine::StateMachine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    #[default]
    Local,
    Strong,
}

pub struct ReadServer {
    state_machine: Arc<StateMachine>,
    monitor: LeadershipMonitor,
    engine: Arc<dyn Consensus>,
    freshness_timeout: Duration,
}

impl ReadServer {
    pub fn new(
        state_machine: Arc<StateMachine>,
        monitor: LeadershipMonitor,
        engine: Arc<dyn Consensus>,
        freshness_timeout: Duration,
    ) -> Self {
        Self {
            state_machine,
            monitor,
            engine,
            freshness_timeout,
        }
    }

    pub async fn handle_read(
        &self,
        key: &[u8],
        consistency: Consistency,
    ) -> Result<Option<Vec<u8>>, ReadError> {
        if consistency == Consistency::Strong {
            self.confirm_freshness().await?;
        }
        Ok(self.state_machine.get(key)?)
    }

    async fn confirm_freshness(&self) -> Result<(), ReadError> {
        if !self.monitor.is_leader() {
            return Err(self.not_leader());
        }

        let started = Instant::now();
        let read_index = tokio::time::timeout(self.freshness_timeout, self.engine.read_index())
            .await
            .map_err(|_| ReadError::Timeout {
                elapsed: started.elapsed(),
            })?
            .map_err(|err| match err {
                ProposeError::NotLeader => self.not_leader(),
                other => ReadError::Engine(other),
            })?;

        let remaining = self.freshness_timeout.saturating_sub(started.elapsed());
        self.state_machine
            .wait_for_applied(read_index, remaining)
            .await
            .map_err(|_| ReadError::Timeout {
                elapsed: started.elapsed(),
            })
    }

    fn not_leader(&self) -> ReadError {
        ReadError::NotLeader {
            leader: self.monitor.current().leader_address().map(str::to_owned),
        }
    }
}
