//! End-to-end tests over real raft nodes talking TCP on localhost.
//!
//! Each node gets its own state machine, leadership monitor and HTTP router.
//! Requests go straight into the routers, so only raft traffic uses sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use raft_kv::api::{self, AppState};
use raft_kv::leadership::LeadershipMonitor;
use raft_kv::membership::ClusterMembership;
use raft_kv::runtime::{NodeConfig, NodeHandle, spawn_node};
use raft_kv::state_machine::StateMachine;
use tower::ServiceExt;

struct ClusterNode {
    handle: NodeHandle,
    monitor: LeadershipMonitor,
    state_machine: Arc<StateMachine>,
    app: Router,
}

/// Test harness for a cluster of real raft nodes with TCP networking.
struct TestCluster {
    nodes: Vec<ClusterNode>,
}

impl TestCluster {
    /// Spawns `n` nodes. Raft ports start at `base_port`, API ports 100 above.
    fn spawn(n: u64, base_port: u16) -> Result<Self> {
        let peers: Vec<String> = (1..=n)
            .map(|id| {
                let raft = base_port + id as u16;
                let api = raft + 100;
                format!("{id}=127.0.0.1:{raft}/127.0.0.1:{api}")
            })
            .collect();
        let membership = ClusterMembership::parse(&peers)?;

        let mut nodes = Vec::new();
        for id in 1..=n {
            let config = NodeConfig {
                id,
                listen_addr: membership.member(id)?.raft_addr,
                membership: membership.clone(),
                snapshot_threshold: 8,
            };
            let state_machine = Arc::new(StateMachine::in_memory());
            let (handle, changes) = spawn_node(config, state_machine.clone())?;
            let (monitor, _task) = LeadershipMonitor::spawn(changes, Vec::new());
            let state = AppState::new(
                id,
                monitor.clone(),
                state_machine.clone(),
                Arc::new(handle.clone()),
                Duration::from_secs(5),
                Duration::from_secs(2),
            );
            nodes.push(ClusterNode {
                handle,
                monitor,
                state_machine,
                app: api::router(state),
            });
        }
        Ok(Self { nodes })
    }

    /// Gets a node by its 1-based raft id.
    fn node(&self, id: u64) -> &ClusterNode {
        &self.nodes[id as usize - 1]
    }

    /// Waits until the leadership monitor of `id` reports leadership.
    async fn wait_for_leader(&self, id: u64, timeout: Duration) -> Result<()> {
        let node = self.node(id);
        eventually(timeout, || node.monitor.is_leader()).await
    }

    /// Waits until one of `candidates` leads, returning its id.
    async fn wait_for_any_leader(&self, candidates: &[u64], timeout: Duration) -> Result<u64> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(&id) = candidates.iter().find(|&&id| self.node(id).monitor.is_leader()) {
                return Ok(id);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        bail!("no leader among {candidates:?} after {timeout:?}")
    }

    async fn wait_for_value(&self, id: u64, key: &[u8], expected: &[u8]) -> Result<()> {
        let sm = &self.node(id).state_machine;
        eventually(Duration::from_secs(5), || {
            matches!(sm.get(key), Ok(Some(value)) if value == expected)
        })
        .await
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.handle.shutdown();
        }
    }
}

async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

async fn send(node: &ClusterNode, method: Method, uri: &str, body: &str) -> Result<Response> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_owned()))?;
    Ok(node.app.clone().oneshot(request).await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_replicate_and_followers_redirect() -> Result<()> {
    let cluster = TestCluster::spawn(3, 19100)?;
    cluster.node(1).handle.campaign().await?;
    cluster.wait_for_leader(1, Duration::from_secs(5)).await?;

    let put = send(cluster.node(1), Method::PUT, "/kv/k1", "v1").await?;
    assert_eq!(put.status(), StatusCode::NO_CONTENT);
    for id in [2, 3] {
        cluster.wait_for_value(id, b"k1", b"v1").await?;
    }

    // Followers learn the leader from the next heartbeat at the latest.
    let follower = cluster.node(2);
    eventually(Duration::from_secs(5), || {
        follower.monitor.current().leader_address() == Some("127.0.0.1:19201")
    })
    .await?;
    let redirected = send(follower, Method::PUT, "/kv/k2", "v2").await?;
    assert_eq!(redirected.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        redirected.headers()[header::LOCATION],
        "http://127.0.0.1:19201/kv/k2"
    );
    assert_eq!(follower.state_machine.get(b"k2")?, None);

    let strong = send(cluster.node(1), Method::GET, "/kv/k1?consistency=strong", "").await?;
    assert_eq!(strong.status(), StatusCode::OK);

    let status = cluster.node(3).handle.status().await?;
    assert_eq!(status.leader_id, 1);
    assert_eq!(status.applied_index, cluster.node(3).state_machine.applied_index());

    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn survivors_elect_a_leader_and_keep_the_data() -> Result<()> {
    let cluster = TestCluster::spawn(3, 19110)?;
    cluster.node(1).handle.campaign().await?;
    cluster.wait_for_leader(1, Duration::from_secs(5)).await?;

    // Enough writes that every replica compacts its log.
    for i in 0..20 {
        let put = send(cluster.node(1), Method::PUT, &format!("/kv/k{i}"), "v").await?;
        assert_eq!(put.status(), StatusCode::NO_CONTENT);
    }
    cluster.wait_for_value(3, b"k19", b"v").await?;

    cluster.node(1).handle.shutdown();
    let leader = cluster
        .wait_for_any_leader(&[2, 3], Duration::from_secs(10))
        .await?;
    let other = if leader == 2 { 3 } else { 2 };

    let put = send(cluster.node(leader), Method::PUT, "/kv/after", "failover").await?;
    assert_eq!(put.status(), StatusCode::NO_CONTENT);
    cluster.wait_for_value(other, b"after", b"failover").await?;
    assert_eq!(cluster.node(other).state_machine.get(b"k0")?, Some(b"v".to_vec()));

    cluster.shutdown();
    Ok(())
}
