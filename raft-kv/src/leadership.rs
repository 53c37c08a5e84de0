//! Tracks whether this node may accept writes.
//!
//! The monitor consumes the engine's leadership stream on a Tokio task and
//! republishes a two-state view ([`Leadership`]) through a `watch` channel,
//! so any number of readers can check it without locking. Leader-only
//! background work is expressed as [`LeaderDuty`] values: they are started on
//! every transition to leader and aborted on every transition away.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::consensus::{LeaderInfo, LeadershipChange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leadership {
    Leader,
    /// Also used while an election is in progress.
    Follower { leader: Option<LeaderInfo> },
}

impl Default for Leadership {
    fn default() -> Self {
        Leadership::Follower { leader: None }
    }
}

impl Leadership {
    pub fn is_leader(&self) -> bool {
        matches!(self, Leadership::Leader)
    }

    /// Where writes should be redirected, if a leader is known.
    pub fn leader_address(&self) -> Option<&str> {
        match self {
            Leadership::Follower { leader: Some(info) } => Some(info.address.as_str()),
            _ => None,
        }
    }
}

/// Background work that runs only while this node is leader.
pub trait LeaderDuty: Send + Sync {
    fn name(&self) -> &str;

    /// Spawns the duty. The returned task is aborted when leadership is lost.
    fn start(&self) -> JoinHandle<()>;
}

/// Logs a heartbeat line at a fixed period while this node leads.
pub struct HeartbeatDuty {
    period: Duration,
}

impl HeartbeatDuty {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl LeaderDuty for HeartbeatDuty {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn start(&self) -> JoinHandle<()> {
        let period = self.period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                info!("leader duty tick");
            }
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Transition {
    BecameLeader,
    SteppedDown,
    LeaderHint,
    Unchanged,
}

/// Folds raw notifications into role transitions.
#[derive(Debug, Default)]
struct Tracker {
    state: Leadership,
}

impl Tracker {
    fn observe(&mut self, change: LeadershipChange) -> Transition {
        if change.is_leader {
            if self.state.is_leader() {
                return Transition::Unchanged;
            }
            self.state = Leadership::Leader;
            return Transition::BecameLeader;
        }

        let next = Leadership::Follower {
            leader: change.leader,
        };
        if next == self.state {
            return Transition::Unchanged;
        }
        let was_leader = self.state.is_leader();
        self.state = next;
        if was_leader {
            Transition::SteppedDown
        } else {
            Transition::LeaderHint
        }
    }
}

/// Read side of the monitor. Cheap to clone.
#[derive(Clone)]
pub struct LeadershipMonitor {
    state: watch::Receiver<Leadership>,
}

impl LeadershipMonitor {
    /// Starts consuming `changes`. The task ends when the engine drops its
    /// sender, aborting any duty still running.
    pub fn spawn(
        changes: mpsc::UnboundedReceiver<LeadershipChange>,
        duties: Vec<Arc<dyn LeaderDuty>>,
    ) -> (Self, JoinHandle<()>) {
        let (state_tx, state_rx) = watch::channel(Leadership::default());
        let task = tokio::spawn(run(changes, state_tx, duties));
        (Self { state: state_rx }, task)
    }

    pub fn current(&self) -> Leadership {
        self.state.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_leader()
    }

    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.state.clone()
    }
}

async fn run(
    mut changes: mpsc::UnboundedReceiver<LeadershipChange>,
    state_tx: watch::Sender<Leadership>,
    duties: Vec<Arc<dyn LeaderDuty>>,
) {
    let mut tracker = Tracker::default();
    let mut running: Vec<JoinHandle<()>> = Vec::new();

    while let Some(change) = changes.recv().await {
        let transition = tracker.observe(change);
        if transition == Transition::Unchanged {
            continue;
        }
        // Publish first: writes stop being accepted before duties wind down.
        state_tx.send_replace(tracker.state.clone());

        match transition {
            Transition::BecameLeader => {
                info!(duties = duties.len(), "became leader");
                running = duties
                    .iter()
                    .map(|duty| {
                        debug!(duty = duty.name(), "starting leader duty");
                        duty.start()
                    })
                    .collect();
            }
            Transition::SteppedDown => {
                info!(leader = ?tracker.state.leader_address(), "lost leadership");
                for task in running.drain(..) {
                    task.abort();
                }
            }
            Transition::LeaderHint => {
                debug!(leader = ?tracker.state.leader_address(), "leader changed");
            }
            Transition::Unchanged => {}
        }
    }

    for task in running {
        task.abort();
    }
}
