use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::error::MembershipError;
use crate::membership::ClusterMembership;
use crate::runtime::NodeConfig;

/// Command-line and environment configuration for one node.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Replicated key-value store node", long_about = None)]
pub struct NodeArgs {
    /// This node's raft id. Must appear in the peer list.
    #[arg(long, env = "RAFT_NODE_ID")]
    pub id: u64,

    /// Address to bind for raft peer traffic. Defaults to this node's raft
    /// address in the peer list.
    #[arg(long, env = "RAFT_ADDRESS")]
    pub raft_listen: Option<SocketAddr>,

    /// Address the HTTP client API listens on.
    #[arg(long, env = "SERVER_ADDRESS", default_value = "127.0.0.1:8080")]
    pub api_listen: SocketAddr,

    /// Cluster members as ID=RAFT_ADDR/API_ADDR, this node included.
    /// Repeat the flag or pass a comma-separated list.
    #[arg(long = "peer", env = "RAFT_PEERS", value_delimiter = ',', required = true)]
    pub peers: Vec<String>,

    /// How long a write waits for its commit before answering with an
    /// unknown outcome.
    #[arg(long, env = "COMMIT_TIMEOUT_MS", default_value_t = 5000,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub commit_timeout_ms: u64,

    /// How long a strong read waits for leadership confirmation.
    #[arg(long, env = "READ_TIMEOUT_MS", default_value_t = 2000,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub read_timeout_ms: u64,

    /// Applied entries kept in the raft log before it is compacted.
    #[arg(long, env = "SNAPSHOT_THRESHOLD", default_value_t = 1024,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub snapshot_threshold: u64,

    /// Start an election right after boot instead of waiting for the
    /// election timeout.
    #[arg(long, env = "RAFT_CAMPAIGN")]
    pub campaign: bool,

    /// Period of the leader-only heartbeat duty.
    #[arg(long, env = "LEADER_HEARTBEAT_SECS", default_value_t = 5,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub leader_heartbeat_secs: u64,
}

impl NodeArgs {
    /// Parses the peer list and checks that it contains this node.
    pub fn membership(&self) -> Result<ClusterMembership, MembershipError> {
        let membership = ClusterMembership::parse(&self.peers)?;
        membership.member(self.id)?;
        Ok(membership)
    }

    pub fn node_config(&self) -> Result<NodeConfig> {
        let membership = self.membership().context("invalid peer list")?;
        let listen_addr = match self.raft_listen {
            Some(addr) => addr,
            None => membership.member(self.id)?.raft_addr,
        };
        Ok(NodeConfig {
            id: self.id,
            listen_addr,
            membership,
            snapshot_threshold: self.snapshot_threshold,
        })
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn leader_heartbeat(&self) -> Duration {
        Duration::from_secs(self.leader_heartbeat_secs)
    }
}
