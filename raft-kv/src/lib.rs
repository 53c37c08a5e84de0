//! Replicated key-value store on top of Raft.
//!
//! Every node keeps a full copy of the dataset. Writes go through the Raft
//! log and are applied to each replica in log order, so replicas that have
//! applied the same prefix hold identical data.
//!
//! # Architecture
//!
//! - **HTTP API** ([`api`]): axum handlers on the Tokio runtime
//! - **Write router** ([`router`]): accepts writes only on the leader and
//!   waits for the commit; followers answer with the leader's address
//! - **Read server** ([`read`]): local reads, or leader-confirmed strong reads
//! - **Leadership monitor** ([`leadership`]): turns the engine's role changes
//!   into a watchable state and runs leader-only duties
//! - **Raft worker** ([`runtime`], [`node`]): a dedicated thread driving
//!   tikv/raft, fed by crossbeam channels, talking to peers over TCP
//! - **State machine** ([`state_machine`]): applies committed commands to a
//!   [`store::KvStore`], takes and restores snapshots
//!
//! The request path only sees the [`consensus::Consensus`] trait, which the
//! raft worker's [`runtime::NodeHandle`] implements.

pub mod api;
pub mod command;
pub mod config;
pub mod consensus;
pub mod error;
pub mod leadership;
pub mod membership;
pub mod node;
pub mod read;
pub mod router;
pub mod runtime;
pub mod state_machine;
pub mod store;
