//! Raft node driving the replicated state machine.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` and feeds every committed entry
//! into the shared [`StateMachine`]. The raft log itself lives in memory
//! ([`NodeStorage`]); compaction discards the prefix that the state machine
//! already covers, and peers that fall behind it are caught up with a
//! snapshot of the state machine.

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use raft::prelude::{ConfState, Config, Entry, EntryType, Message, RawNode, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage};
use raft::{RaftState, ReadState, SnapshotStatus, StateRole, Storage};
use slog::{Logger, o};
use tracing::{debug, info, warn};

use crate::error::ProposeError;
use crate::state_machine::StateMachine;

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a slog logger; the node logs through
/// `tracing` instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// One committed entry that has been applied locally.
///
/// Reported for every entry, including leader no-ops, so the runtime can
/// settle the proposal waiting at `index`: the proposal made it only if the
/// term matches the one it was proposed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
}

/// Output from one pass over the raft ready state.
#[derive(Debug, Default)]
pub struct ReadyBundle {
    /// Messages to send to other nodes.
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
    /// Read-index requests confirmed by a quorum.
    pub read_states: Vec<ReadState>,
    /// Index of a leader snapshot installed during this pass.
    pub restored: Option<u64>,
}

fn snapshot_unavailable() -> raft::Error {
    raft::Error::Store(raft::StorageError::SnapshotTemporarilyUnavailable)
}

/// Raft log storage that serves snapshots from the state machine.
///
/// Entries, hard state and configuration are kept in a `MemStorage`. When a
/// peer needs entries that were compacted away, raft asks for a snapshot and
/// gets the state machine's current dataset, stamped with its applied index.
#[derive(Clone)]
pub struct NodeStorage {
    log: MemStorage,
    state_machine: Arc<StateMachine>,
}

impl NodeStorage {
    fn new(voters: &[u64], state_machine: Arc<StateMachine>) -> Self {
        Self {
            log: MemStorage::new_with_conf_state(ConfState::from((voters.to_vec(), vec![]))),
            state_machine,
        }
    }
}

impl Storage for NodeStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.log.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.log.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.log.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.log.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.log.last_index()
    }

    // Raft treats any error other than `SnapshotTemporarilyUnavailable` as
    // fatal, so failures here only postpone the transfer.
    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let handle = self.state_machine.snapshot().map_err(|err| {
            warn!(to, error = %err, "capturing snapshot failed");
            snapshot_unavailable()
        })?;
        let index = handle.index();
        if index == 0 || index < request_index {
            return Err(snapshot_unavailable());
        }
        let term = self.log.term(index).map_err(|_| snapshot_unavailable())?;
        let conf_state = self.log.initial_state()?.conf_state;
        let data = handle.to_bytes().map_err(|err| {
            warn!(to, error = %err, "encoding snapshot failed");
            snapshot_unavailable()
        })?;
        let entries = handle.len();
        handle.release();

        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(conf_state);
        info!(to, index, term, entries, "sending snapshot");
        Ok(snapshot)
    }
}

/// A Raft consensus node bound to a state machine.
///
/// The node exposes a small interface: `propose` and `read_index` to submit
/// requests, `step` to process incoming Raft messages, `poll_ready` to
/// advance state, and `maybe_compact` to bound the in-memory log.
pub struct RaftNode {
    id: u64,
    raw: RawNode<NodeStorage>,
    storage: NodeStorage,
    state_machine: Arc<StateMachine>,
}

impl RaftNode {
    /// Creates a node with the given ID over a fresh in-memory log.
    ///
    /// `voters` lists all voting members and must include `id`. With the
    /// runtime ticking every 100ms, elections start after 1-2 seconds without
    /// a leader and the leader heartbeats every 300ms. A leader that has not
    /// heard from a quorum for an election timeout steps down, and
    /// candidates pre-vote so a rejoining node cannot disrupt a live leader.
    pub fn new(id: u64, voters: &[u64], state_machine: Arc<StateMachine>) -> Result<Self> {
        ensure!(voters.contains(&id), "node {id} is not one of the voters {voters:?}");
        ensure!(
            state_machine.applied_index() == 0,
            "state machine must be empty when the raft log starts empty"
        );

        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        let storage = NodeStorage::new(voters, state_machine.clone());
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self {
            id,
            raw,
            storage,
            state_machine,
        })
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election to become leader.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn commit_index(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    pub fn applied_index(&self) -> u64 {
        self.state_machine.applied_index()
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state_machine
    }

    /// Appends `data` to the log and returns the `(index, term)` it was
    /// assigned. Only the leader accepts proposals; a follower would forward
    /// them and the caller could not tell where they landed.
    ///
    /// Success here only means "added to the leader's log". The entry is
    /// committed once an [`ApplyReport`] with the same index and term shows up.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(u64, u64), ProposeError> {
        if self.role() != StateRole::Leader {
            return Err(ProposeError::NotLeader);
        }
        self.raw.propose(vec![], data).map_err(|err| match err {
            raft::Error::ProposalDropped => ProposeError::NotLeader,
            other => ProposeError::Engine(other.to_string()),
        })?;
        Ok((self.raw.raft.raft_log.last_index(), self.raw.raft.term))
    }

    /// Asks the cluster to confirm this node's leadership. The answer comes
    /// back as a [`ReadState`] carrying `ctx` from a later `poll_ready`.
    pub fn read_index(&mut self, ctx: Vec<u8>) -> Result<(), ProposeError> {
        if self.role() != StateRole::Leader {
            return Err(ProposeError::NotLeader);
        }
        self.raw.read_index(ctx);
        Ok(())
    }

    /// Tells raft that a message to `to` could not be delivered, so it stops
    /// optimistically streaming to that peer. A failed snapshot transfer is
    /// reported as well, otherwise the peer would wait on it forever.
    pub fn report_send_failure(&mut self, to: u64, snapshot: bool) {
        self.raw.report_unreachable(to);
        if snapshot {
            self.raw.report_snapshot(to, SnapshotStatus::Failure);
        }
    }

    /// Processes a Raft message from another node.
    ///
    /// A refused message leaves the node unchanged; the caller decides
    /// whether that matters.
    pub fn step(&mut self, msg: Message) -> raft::Result<()> {
        self.raw.step(msg)
    }

    /// Processes pending raft work, returning `None` when there is none.
    ///
    /// Errors are fatal: they mean a committed entry or a leader snapshot
    /// could not be applied, and continuing would let this replica diverge.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut bundle = ReadyBundle {
            messages: ready.take_messages(),
            ..ReadyBundle::default()
        };

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            let index = snapshot.get_metadata().index;
            let restored = self
                .state_machine
                .restore(&snapshot.data[..])
                .with_context(|| format!("failed to restore snapshot at index {index}"))?;
            ensure!(
                restored == index,
                "snapshot at index {index} carried state for index {restored}"
            );
            self.storage
                .log
                .wl()
                .apply_snapshot(snapshot)
                .context("apply snapshot failed")?;
            bundle.restored = Some(index);
        }

        bundle
            .applied
            .extend(self.apply_entries(ready.take_committed_entries())?);

        if !ready.entries().is_empty() {
            self.storage
                .log
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.log.wl().set_hardstate(hard_state.clone());
        }

        bundle.read_states = ready.read_states().to_vec();
        bundle.messages.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.log.wl().mut_hard_state().set_commit(commit);
        }

        bundle.messages.extend(light_ready.take_messages());
        bundle
            .applied
            .extend(self.apply_entries(light_ready.take_committed_entries())?);

        self.raw.advance_apply();

        Ok(Some(bundle))
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.entry_type() == EntryType::EntryNormal && !entry.data.is_empty() {
                self.state_machine.apply(entry.index, &entry.data[..])?;
            } else {
                // Leader no-ops; membership is static so no conf change is
                // ever proposed.
                self.state_machine.apply_noop(entry.index)?;
            }
            applied.push(ApplyReport {
                index: entry.index,
                term: entry.term,
            });
        }
        Ok(applied)
    }

    /// Discards log entries covered by the state machine once at least
    /// `threshold` of them have accumulated. Returns whether it compacted.
    pub fn maybe_compact(&mut self, threshold: u64) -> Result<bool> {
        let applied = self.state_machine.applied_index();
        let first = self.storage.log.first_index()?;
        if threshold == 0 || applied < first || applied - first < threshold {
            return Ok(false);
        }
        // Entry `applied` itself stays, so its term can still stamp snapshots.
        self.storage
            .log
            .wl()
            .compact(applied)
            .with_context(|| format!("compacting log to {applied} failed"))?;
        debug!(node = self.id, compacted_to = applied, "compacted raft log");
        Ok(true)
    }
}
