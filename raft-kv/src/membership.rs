use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::consensus::LeaderInfo;
use crate::error::MembershipError;

/// One voter: where its Raft transport listens and where clients reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    pub raft_addr: SocketAddr,
    pub api_addr: SocketAddr,
}

impl FromStr for Member {
    type Err = MembershipError;

    /// Parses `ID=RAFT_ADDR/API_ADDR`, e.g. `1=127.0.0.1:7101/127.0.0.1:8101`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MembershipError::InvalidPeer(s.to_string());
        let (id, addrs) = s.trim().split_once('=').ok_or_else(invalid)?;
        let (raft_addr, api_addr) = addrs.split_once('/').ok_or_else(invalid)?;
        Ok(Member {
            id: id.trim().parse().map_err(|_| invalid())?,
            raft_addr: raft_addr.trim().parse().map_err(|_| invalid())?,
            api_addr: api_addr.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Static view of the voters in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMembership {
    members: BTreeMap<u64, Member>,
}

impl ClusterMembership {
    pub fn new(members: impl IntoIterator<Item = Member>) -> Result<Self, MembershipError> {
        let mut map = BTreeMap::new();
        for member in members {
            if member.id == 0 {
                return Err(MembershipError::ZeroId);
            }
            if map.insert(member.id, member).is_some() {
                return Err(MembershipError::DuplicateId(member.id));
            }
        }
        if map.is_empty() {
            return Err(MembershipError::Empty);
        }
        Ok(Self { members: map })
    }

    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, MembershipError> {
        let members = entries
            .iter()
            .map(|entry| entry.as_ref().parse())
            .collect::<Result<Vec<Member>, _>>()?;
        Self::new(members)
    }

    pub fn member(&self, id: u64) -> Result<&Member, MembershipError> {
        self.members.get(&id).ok_or(MembershipError::UnknownNode(id))
    }

    /// Voter ids in ascending order.
    pub fn voters(&self) -> Vec<u64> {
        self.members.keys().copied().collect()
    }

    pub fn raft_addr(&self, id: u64) -> Option<SocketAddr> {
        self.members.get(&id).map(|m| m.raft_addr)
    }

    /// Leader details for a Raft leader id; `None` for 0 (no leader) or an unknown id.
    pub fn leader_info(&self, id: u64) -> Option<LeaderInfo> {
        self.members.get(&id).map(|m| LeaderInfo {
            id,
            address: m.api_addr.to_string(),
        })
    }
}
