//! Worker runtime and peer transport for a Raft node.
//!
//! - **Worker thread**: owns the [`RaftNode`], runs the event loop, settles
//!   waiting proposals and read-index requests
//! - **Listener thread**: accepts peer connections, one reader thread each
//! - **Peer sender threads**: one per peer, keeps a connection open and
//!   writes outbound messages in order from a bounded queue
//!
//! The request path talks to the worker through [`NodeHandle`], which
//! implements [`Consensus`]. Requests travel over a crossbeam channel and
//! answers come back on Tokio oneshots, so async callers never block.
//!
//! Peer frames are a 4-byte big-endian length followed by a protobuf-encoded
//! raft `Message`.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, ensure};
use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use prost::Message as ProstMessage;
use raft::prelude::{Message, MessageType};
use raft::{ReadState, StateRole};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::consensus::{Consensus, LeadershipChange};
use crate::error::ProposeError;
use crate::membership::ClusterMembership;
use crate::node::{ApplyReport, RaftNode};
use crate::state_machine::StateMachine;

/// Raft logical clock interval. Heartbeats go out every 3 ticks and
/// elections start after 10-20 ticks without a leader.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Largest peer frame accepted. Snapshots travel as a single message.
const MAX_MESSAGE_BYTES: usize = 512 * 1024 * 1024;

/// Outbound messages queued per peer. Past this the peer is treated as
/// unreachable and raft retransmits once it answers again.
const PEER_QUEUE_CAPACITY: usize = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for spawning a Raft node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's ID; must be a member of `membership`.
    pub id: u64,
    /// Address to bind for incoming Raft messages.
    pub listen_addr: SocketAddr,
    pub membership: ClusterMembership,
    /// Compact the raft log once this many applied entries have piled up.
    pub snapshot_threshold: u64,
}

/// Point-in-time view of the raft node.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: StateRole,
    /// 0 while no leader is known.
    pub leader_id: u64,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
}

type Responder<T> = oneshot::Sender<Result<T, ProposeError>>;

/// Requests sent to the worker thread.
enum ClientRequest {
    Propose {
        payload: Vec<u8>,
        respond_to: Responder<u64>,
    },
    ReadIndex {
        respond_to: Responder<u64>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Campaign {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Everything the worker receives from the network side.
enum Inbound {
    Message(Message),
    /// A peer sender thread failed to deliver a message.
    Unreachable { to: u64, snapshot: bool },
}

/// Handle for sending requests to a running Raft node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    id: u64,
    request_tx: Sender<ClientRequest>,
}

impl NodeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Status { respond_to })
            .map_err(|_| anyhow!("raft worker {} is not running", self.id))?;
        response.await.context("status response channel closed")
    }

    /// Forces this node to start an election campaign.
    pub async fn campaign(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Campaign { respond_to })
            .map_err(|_| anyhow!("raft worker {} is not running", self.id))?;
        response.await.context("campaign response channel closed")?
    }

    /// Signals the worker to shut down. Waiting proposals resolve as
    /// abandoned.
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(ClientRequest::Shutdown);
    }
}

#[async_trait]
impl Consensus for NodeHandle {
    async fn propose(&self, payload: Vec<u8>) -> Result<u64, ProposeError> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::Propose {
                payload,
                respond_to,
            })
            .map_err(|_| ProposeError::Stopped)?;
        // Once the worker has the proposal, a dropped responder means it
        // stopped without learning the entry's fate.
        response.await.map_err(|_| ProposeError::Abandoned)?
    }

    async fn read_index(&self) -> Result<u64, ProposeError> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(ClientRequest::ReadIndex { respond_to })
            .map_err(|_| ProposeError::Stopped)?;
        response.await.map_err(|_| ProposeError::Stopped)?
    }
}

/// Spawns a Raft node bound to `state_machine`.
///
/// Returns the handle plus the node's leadership stream. The stream yields a
/// [`LeadershipChange`] whenever this node gains or loses leadership or
/// learns of a different leader, in the order raft observed them.
///
/// # Errors
///
/// Returns error if `config.id` is not a member, the listener cannot bind to
/// `config.listen_addr`, or a thread cannot be spawned.
pub fn spawn_node(
    config: NodeConfig,
    state_machine: Arc<StateMachine>,
) -> Result<(NodeHandle, mpsc::UnboundedReceiver<LeadershipChange>)> {
    config.membership.member(config.id)?;
    let voters = config.membership.voters();
    let node = RaftNode::new(config.id, &voters, state_machine)?;

    let (client_tx, client_rx) = unbounded();
    let (inbound_tx, inbound_rx) = unbounded();
    let (changes_tx, changes_rx) = mpsc::unbounded_channel();

    let listener = TcpListener::bind(config.listen_addr)
        .with_context(|| format!("failed to bind raft listener on {}", config.listen_addr))?;
    let listener = spawn_network_listener(config.id, listener, inbound_tx.clone())?;

    let mut peers = HashMap::new();
    for &peer in voters.iter().filter(|&&peer| peer != config.id) {
        let addr = config
            .membership
            .raft_addr(peer)
            .ok_or_else(|| anyhow!("no raft address for peer {peer}"))?;
        peers.insert(peer, spawn_peer_sender(config.id, peer, addr, inbound_tx.clone())?);
    }

    let id = config.id;
    let worker = Worker::new(
        node,
        config.membership,
        peers,
        config.snapshot_threshold,
        client_rx,
        inbound_rx,
        changes_tx,
        listener,
    );
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || worker.run_to_completion())
        .context("failed to spawn raft worker")?;

    info!(node = id, voters = ?voters, "raft node started");
    Ok((
        NodeHandle {
            id,
            request_tx: client_tx,
        },
        changes_rx,
    ))
}

struct PendingProposal {
    term: u64,
    respond_to: Responder<u64>,
}

/// Client requests waiting on raft progress.
#[derive(Default)]
struct Pending {
    /// Keyed by the log index the proposal was appended at.
    proposals: BTreeMap<u64, PendingProposal>,
    /// Keyed by the id carried in the read-index request context.
    reads: HashMap<u64, Responder<u64>>,
    next_read_id: u64,
}

impl Pending {
    fn track_proposal(&mut self, index: u64, term: u64, respond_to: Responder<u64>) {
        self.proposals
            .insert(index, PendingProposal { term, respond_to });
    }

    /// Resolves the proposal waiting at the reported index. A different term
    /// means a newer leader overwrote it, so it will never apply.
    fn settle(&mut self, report: ApplyReport) {
        let Some(pending) = self.proposals.remove(&report.index) else {
            return;
        };
        let result = if pending.term == report.term {
            Ok(report.index)
        } else {
            Err(ProposeError::Superseded {
                index: report.index,
                term: report.term,
            })
        };
        let _ = pending.respond_to.send(result);
    }

    /// A leader snapshot replaced the log up to `index`; whether proposals
    /// in that range made it cannot be told any more.
    fn abandon_through(&mut self, index: u64) {
        let later = self.proposals.split_off(&(index + 1));
        for (_, pending) in mem::replace(&mut self.proposals, later) {
            let _ = pending.respond_to.send(Err(ProposeError::Abandoned));
        }
    }

    fn track_read(&mut self, respond_to: Responder<u64>) -> Vec<u8> {
        self.next_read_id += 1;
        self.reads.insert(self.next_read_id, respond_to);
        self.next_read_id.to_be_bytes().to_vec()
    }

    fn confirm_read(&mut self, state: &ReadState) {
        let Ok(id) = <[u8; 8]>::try_from(state.request_ctx.as_slice()) else {
            return;
        };
        if let Some(respond_to) = self.reads.remove(&u64::from_be_bytes(id)) {
            let _ = respond_to.send(Ok(state.index));
        }
    }

    fn fail_reads(&mut self, err: ProposeError) {
        for (_, respond_to) in self.reads.drain() {
            let _ = respond_to.send(Err(err.clone()));
        }
    }
}

/// The worker that runs the Raft event loop.
struct Worker {
    node: RaftNode,
    membership: ClusterMembership,
    peers: HashMap<u64, Sender<Message>>,
    snapshot_threshold: u64,
    client_rx: Receiver<ClientRequest>,
    inbound_rx: Receiver<Inbound>,
    changes_tx: mpsc::UnboundedSender<LeadershipChange>,
    listener: NetworkListener,
    pending: Pending,
    last_role: StateRole,
    last_leader: u64,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        node: RaftNode,
        membership: ClusterMembership,
        peers: HashMap<u64, Sender<Message>>,
        snapshot_threshold: u64,
        client_rx: Receiver<ClientRequest>,
        inbound_rx: Receiver<Inbound>,
        changes_tx: mpsc::UnboundedSender<LeadershipChange>,
        listener: NetworkListener,
    ) -> Self {
        let last_role = node.role();
        let last_leader = node.leader_id();
        Self {
            node,
            membership,
            peers,
            snapshot_threshold,
            client_rx,
            inbound_rx,
            changes_tx,
            listener,
            pending: Pending::default(),
            last_role,
            last_leader,
        }
    }

    fn run_to_completion(mut self) {
        let id = self.node.id();
        if let Err(err) = self.run() {
            error!(node = id, error = ?err, "raft worker crashed");
        }
        self.listener.stop();
        // Nothing will be applied from here on.
        self.pending.fail_reads(ProposeError::Stopped);
        if self.last_role == StateRole::Leader || self.last_leader != 0 {
            let _ = self.changes_tx.send(LeadershipChange {
                is_leader: false,
                leader: None,
            });
        }
        info!(node = id, "raft worker stopped");
    }

    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL.saturating_sub(last_tick.elapsed());

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.inbound_rx) -> inbound => {
                    match inbound {
                        Ok(Inbound::Message(msg)) => self.step_message(msg),
                        Ok(Inbound::Unreachable { to, snapshot }) => {
                            self.node.report_send_failure(to, snapshot);
                        }
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.publish_leadership();
        }
        Ok(())
    }

    /// Returns `false` if shutdown was requested.
    fn handle_client_request(&mut self, req: ClientRequest) -> Result<bool> {
        match req {
            ClientRequest::Propose {
                payload,
                respond_to,
            } => match self.node.propose(payload) {
                Ok((index, term)) => {
                    debug!(index, term, "proposed entry");
                    self.pending.track_proposal(index, term, respond_to);
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            ClientRequest::ReadIndex { respond_to } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(ProposeError::NotLeader));
                } else {
                    let ctx = self.pending.track_read(respond_to);
                    // Leadership was checked above, so this cannot fail.
                    let _ = self.node.read_index(ctx);
                }
            }
            ClientRequest::Status { respond_to } => {
                let _ = respond_to.send(NodeStatus {
                    node_id: self.node.id(),
                    role: self.node.role(),
                    leader_id: self.node.leader_id(),
                    term: self.node.term(),
                    commit_index: self.node.commit_index(),
                    applied_index: self.node.applied_index(),
                });
            }
            ClientRequest::Campaign { respond_to } => {
                let previous = self.node.role();
                let result = self.node.campaign();
                if result.is_ok() {
                    info!(node = self.node.id(), ?previous, "campaign initiated");
                }
                let _ = respond_to.send(result);
            }
            ClientRequest::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Drains all ready state from raft, then compacts the log if due.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg);
            }
            if let Some(index) = bundle.restored {
                info!(node = self.node.id(), index, "installed leader snapshot");
                self.pending.abandon_through(index);
            }
            for report in bundle.applied {
                self.pending.settle(report);
            }
            for state in &bundle.read_states {
                self.pending.confirm_read(state);
            }
        }
        self.node.maybe_compact(self.snapshot_threshold)?;
        Ok(())
    }

    /// Feeds a message into raft. Peers are not trusted to send only what
    /// raft accepts, so a refused message is dropped and the node carries on.
    fn step_message(&mut self, msg: Message) {
        let from = msg.from;
        let msg_type = msg.msg_type();
        if let Err(err) = self.node.step(msg) {
            warn!(from, ?msg_type, error = %err, "dropping message raft refused");
        }
    }

    /// Messages addressed to this node are fed back into `step`; everything
    /// else is queued on the destination's sender thread.
    fn dispatch_message(&mut self, msg: Message) {
        if msg.to == self.node.id() {
            self.step_message(msg);
            return;
        }
        let to = msg.to;
        let Some(sender) = self.peers.get(&to) else {
            warn!(to, "no address for peer, dropping message");
            return;
        };
        match sender.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                debug!(to, "peer queue full, dropping message");
                let snapshot = msg.msg_type() == MessageType::MsgSnapshot;
                self.node.report_send_failure(to, snapshot);
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(to, "peer sender is gone, dropping message");
            }
        }
    }

    /// Reports role and leader changes on the leadership stream.
    fn publish_leadership(&mut self) {
        let role = self.node.role();
        let leader = self.node.leader_id();
        if role == self.last_role && leader == self.last_leader {
            return;
        }
        info!(
            node = self.node.id(),
            from = ?self.last_role,
            to = ?role,
            leader,
            term = self.node.term(),
            "role changed"
        );

        let was_leader = self.last_role == StateRole::Leader;
        let is_leader = role == StateRole::Leader;
        if was_leader && !is_leader {
            // Read-index requests are only answered by the leader that took them.
            self.pending.fail_reads(ProposeError::NotLeader);
        }
        if was_leader != is_leader || leader != self.last_leader {
            let _ = self.changes_tx.send(LeadershipChange {
                is_leader,
                leader: self.membership.leader_info(leader),
            });
        }
        self.last_role = role;
        self.last_leader = leader;
    }
}

/// Handle to the accept thread. Stopping it closes the raft port.
struct NetworkListener {
    addr: SocketAddr,
    stopped: Arc<AtomicBool>,
}

impl NetworkListener {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept so the thread sees the flag.
        let mut wake = self.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            });
        }
        let _ = TcpStream::connect_timeout(&wake, CONNECT_TIMEOUT);
    }
}

/// Accepts peer connections on a background thread, one reader thread per
/// connection. Readers exit once the worker stops consuming their frames.
fn spawn_network_listener(
    id: u64,
    listener: TcpListener,
    tx: Sender<Inbound>,
) -> Result<NetworkListener> {
    let addr = listener.local_addr().context("raft listener has no address")?;
    let stopped = Arc::new(AtomicBool::new(false));
    let flag = stopped.clone();
    thread::Builder::new()
        .name(format!("raft-net-listener-{id}"))
        .spawn(move || {
            for stream in listener.incoming() {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = %err, "peer connection closed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
            debug!(node = id, "raft listener closed");
        })
        .context("failed to spawn network listener")?;
    Ok(NetworkListener { addr, stopped })
}

/// Reads frames until the peer closes the connection.
fn handle_connection(mut stream: TcpStream, tx: Sender<Inbound>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        ensure!(
            len <= MAX_MESSAGE_BYTES,
            "peer frame of {len} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit"
        );
        // Grows with the bytes that actually arrive, not the announced length.
        let mut buf = Vec::new();
        (&mut stream).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() < len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("peer frame truncated at {} of {len} bytes", buf.len()),
            )
            .into());
        }
        let msg = Message::decode(&buf[..]).context("failed to decode raft message")?;
        if tx.send(Inbound::Message(msg)).is_err() {
            return Ok(());
        }
    }
}

/// Starts the thread that delivers messages to one peer, in order.
///
/// The connection is opened lazily and reopened after any failure. Messages
/// that cannot be written are dropped; raft retransmits, and the worker is
/// told so it can slow down replication to that peer.
fn spawn_peer_sender(
    from: u64,
    to: u64,
    addr: SocketAddr,
    inbound: Sender<Inbound>,
) -> Result<Sender<Message>> {
    let (tx, rx) = bounded::<Message>(PEER_QUEUE_CAPACITY);
    thread::Builder::new()
        .name(format!("raft-peer-{from}-{to}"))
        .spawn(move || {
            let mut stream = None;
            for msg in rx {
                let snapshot = msg.msg_type() == MessageType::MsgSnapshot;
                if let Err(err) = write_frame(&mut stream, addr, &msg.encode_to_vec()) {
                    debug!(to, %addr, error = %err, "failed to send message");
                    if inbound.send(Inbound::Unreachable { to, snapshot }).is_err() {
                        break;
                    }
                }
            }
        })
        .context("failed to spawn peer sender")?;
    Ok(tx)
}

fn write_frame(stream: &mut Option<TcpStream>, addr: SocketAddr, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    // A connection that failed mid-write is dropped here and reopened next time.
    let mut conn = match stream.take() {
        Some(conn) => conn,
        None => {
            let conn = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
            conn.set_nodelay(true)?;
            conn.set_write_timeout(Some(WRITE_TIMEOUT))?;
            conn
        }
    };
    conn.write_all(&len.to_be_bytes())?;
    conn.write_all(bytes)?;
    *stream = Some(conn);
    Ok(())
}
