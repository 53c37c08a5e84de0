//! Runs one replicated key-value node: the raft worker plus the HTTP API.
//!
//! Start a 3-node cluster:
//! ```bash
//! PEERS=1=127.0.0.1:7101/127.0.0.1:8101,2=127.0.0.1:7102/127.0.0.1:8102,3=127.0.0.1:7103/127.0.0.1:8103
//!
//! cargo run --bin node -- --id 1 --api-listen 127.0.0.1:8101 --peer $PEERS --campaign
//! cargo run --bin node -- --id 2 --api-listen 127.0.0.1:8102 --peer $PEERS
//! cargo run --bin node -- --id 3 --api-listen 127.0.0.1:8103 --peer $PEERS
//!
//! curl -i -X PUT --data-binary v1 http://127.0.0.1:8101/kv/k1
//! curl -i http://127.0.0.1:8102/kv/k1
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use raft_kv::api::{self, AppState};
use raft_kv::config::NodeArgs;
use raft_kv::consensus::Consensus;
use raft_kv::leadership::{HeartbeatDuty, LeaderDuty, LeadershipMonitor};
use raft_kv::runtime::spawn_node;
use raft_kv::state_machine::StateMachine;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = NodeArgs::parse();
    let config = args.node_config()?;
    let state_machine = Arc::new(StateMachine::in_memory());
    let (handle, changes) = spawn_node(config, state_machine.clone())?;

    let duties: Vec<Arc<dyn LeaderDuty>> =
        vec![Arc::new(HeartbeatDuty::new(args.leader_heartbeat()))];
    let (monitor, monitor_task) = LeadershipMonitor::spawn(changes, duties);

    if args.campaign {
        handle.campaign().await.context("initial campaign failed")?;
    }

    let engine: Arc<dyn Consensus> = Arc::new(handle.clone());
    let state = AppState::new(
        args.id,
        monitor,
        state_machine,
        engine,
        args.commit_timeout(),
        args.read_timeout(),
    );

    let listener = TcpListener::bind(args.api_listen)
        .await
        .with_context(|| format!("failed to bind client API on {}", args.api_listen))?;
    info!(node = args.id, addr = %listener.local_addr()?, "client API listening");

    let served = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    handle.shutdown();
    if tokio::time::timeout(Duration::from_secs(2), monitor_task)
        .await
        .is_err()
    {
        warn!("leadership monitor did not stop in time");
    }
    served.context("client API server failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
