//! Shared helpers for tests that drive the request path against a scripted
//! consensus engine instead of a real raft cluster.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use raft_kv::consensus::{Consensus, LeaderInfo, LeadershipChange};
use raft_kv::error::ProposeError;
use raft_kv::leadership::LeadershipMonitor;
use raft_kv::state_machine::StateMachine;
use tokio::sync::mpsc;

/// What the stub does with the next proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Commit and apply immediately.
    Apply,
    /// Keep the proposal without ever answering, as if the commit is slow.
    Park,
    /// Report that a newer leader overwrote the entry.
    Supersede,
    NotLeader,
    Abandon,
}

/// Consensus engine stand-in that assigns consecutive indexes and applies
/// straight into the state machine.
pub struct StubEngine {
    pub state_machine: Arc<StateMachine>,
    mode: Mutex<Mode>,
    next_index: AtomicU64,
    proposals: AtomicUsize,
    parked: Mutex<Vec<(u64, Vec<u8>)>>,
    read_index: Mutex<Option<Result<u64, ProposeError>>>,
}

impl StubEngine {
    pub fn new(state_machine: Arc<StateMachine>) -> Arc<Self> {
        Arc::new(Self {
            state_machine,
            mode: Mutex::new(Mode::Apply),
            next_index: AtomicU64::new(0),
            proposals: AtomicUsize::new(0),
            parked: Mutex::new(Vec::new()),
            read_index: Mutex::new(None),
        })
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    /// Overrides the read index; by default it is the applied index.
    pub fn set_read_index(&self, answer: Result<u64, ProposeError>) {
        *self.read_index.lock() = Some(answer);
    }

    pub fn proposals(&self) -> usize {
        self.proposals.load(Ordering::SeqCst)
    }

    pub fn parked_len(&self) -> usize {
        self.parked.lock().len()
    }

    /// Hands out the parked proposals without applying them.
    pub fn take_parked(&self) -> Vec<(u64, Vec<u8>)> {
        std::mem::take(&mut *self.parked.lock())
    }

    /// Lets parked proposals commit, in index order.
    pub fn release_parked(&self) {
        for (index, payload) in self.take_parked() {
            self.state_machine
                .apply(index, &payload)
                .expect("parked entry applies");
        }
    }

    /// Waits until `count` proposals are parked.
    pub async fn wait_parked(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.parked_len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("proposal was never parked");
    }
}

#[async_trait]
impl Consensus for StubEngine {
    async fn propose(&self, payload: Vec<u8>) -> Result<u64, ProposeError> {
        self.proposals.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        match mode {
            Mode::NotLeader => return Err(ProposeError::NotLeader),
            Mode::Abandon => return Err(ProposeError::Abandoned),
            _ => {}
        }

        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        match mode {
            Mode::Apply => {
                self.state_machine
                    .apply(index, &payload)
                    .map_err(|err| ProposeError::Engine(err.to_string()))?;
                Ok(index)
            }
            Mode::Park => {
                self.parked.lock().push((index, payload));
                std::future::pending().await
            }
            Mode::Supersede => Err(ProposeError::Superseded { index, term: 2 }),
            Mode::NotLeader | Mode::Abandon => unreachable!("answered above"),
        }
    }

    async fn read_index(&self) -> Result<u64, ProposeError> {
        let answer = self.read_index.lock().clone();
        answer.unwrap_or_else(|| Ok(self.state_machine.applied_index()))
    }
}

/// A leadership monitor fed by hand.
pub struct Leadership {
    pub monitor: LeadershipMonitor,
    changes: mpsc::UnboundedSender<LeadershipChange>,
}

impl Leadership {
    pub fn spawn() -> Self {
        let (changes, rx) = mpsc::unbounded_channel();
        let (monitor, _task) = LeadershipMonitor::spawn(rx, Vec::new());
        Self { monitor, changes }
    }

    pub async fn become_leader(&self) {
        self.changes
            .send(LeadershipChange {
                is_leader: true,
                leader: None,
            })
            .expect("monitor running");
        self.settle(|state| state.is_leader()).await;
    }

    /// Steps down to follower of `leader` (`None`: election in progress).
    pub async fn follow(&self, leader: Option<(u64, &str)>) {
        let leader = leader.map(|(id, address)| LeaderInfo {
            id,
            address: address.to_string(),
        });
        let expected = leader.as_ref().map(|info| info.address.clone());
        self.changes
            .send(LeadershipChange {
                is_leader: false,
                leader,
            })
            .expect("monitor running");
        self.settle(move |state| {
            !state.is_leader() && state.leader_address().map(str::to_owned) == expected
        })
        .await;
    }

    async fn settle(&self, done: impl FnMut(&raft_kv::leadership::Leadership) -> bool) {
        let mut state = self.monitor.subscribe();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(done))
            .await
            .expect("leadership change not observed")
            .expect("monitor stopped");
    }
}
