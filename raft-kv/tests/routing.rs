//! Write routing and read freshness against a scripted engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use raft_kv::command::Command;
use raft_kv::error::{ApplyError, CodecError, ProposeError, ReadError, WriteError};
use raft_kv::read::{Consistency, ReadServer};
use raft_kv::router::{WriteAck, WriteRouter};
use raft_kv::state_machine::StateMachine;

use common::{Leadership, Mode, StubEngine};

const LEADER_API: &str = "127.0.0.1:8102";

struct Harness {
    leadership: Leadership,
    engine: Arc<StubEngine>,
    sm: Arc<StateMachine>,
    writes: WriteRouter,
    reads: ReadServer,
}

fn harness(commit_timeout: Duration, read_timeout: Duration) -> Harness {
    let sm = Arc::new(StateMachine::in_memory());
    let engine = StubEngine::new(sm.clone());
    let leadership = Leadership::spawn();
    let writes = WriteRouter::new(leadership.monitor.clone(), engine.clone(), commit_timeout);
    let reads = ReadServer::new(
        sm.clone(),
        leadership.monitor.clone(),
        engine.clone(),
        read_timeout,
    );
    Harness {
        leadership,
        engine,
        sm,
        writes,
        reads,
    }
}

fn default_harness() -> Harness {
    harness(Duration::from_secs(5), Duration::from_secs(2))
}

#[tokio::test]
async fn leader_applies_put_put_delete() -> Result<()> {
    let h = default_harness();
    h.leadership.become_leader().await;

    assert_eq!(h.writes.put(b"a".to_vec(), b"1".to_vec()).await?, WriteAck { index: 1 });
    assert_eq!(h.writes.put(b"a".to_vec(), b"2".to_vec()).await?, WriteAck { index: 2 });
    assert_eq!(h.writes.delete(b"b".to_vec()).await?, WriteAck { index: 3 });

    assert_eq!(h.sm.get(b"a")?, Some(b"2".to_vec()));
    assert_eq!(h.sm.get(b"b")?, None);
    assert_eq!(h.sm.applied_index(), 3);
    Ok(())
}

#[tokio::test]
async fn follower_redirects_without_touching_the_log() -> Result<()> {
    let h = default_harness();
    h.leadership.follow(Some((2, LEADER_API))).await;

    let err = h.writes.put(b"k".to_vec(), b"v".to_vec()).await.unwrap_err();
    match err {
        WriteError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some(LEADER_API)),
        other => panic!("expected a redirect, got {other:?}"),
    }
    assert_eq!(h.engine.proposals(), 0);
    assert_eq!(h.sm.applied_index(), 0);
    assert_eq!(h.sm.get(b"k")?, None);
    Ok(())
}

#[tokio::test]
async fn no_known_leader_means_no_redirect_target() {
    let h = default_harness();
    let err = h.writes.delete(b"k".to_vec()).await.unwrap_err();
    assert!(matches!(err, WriteError::NotLeader { leader: None }));
    assert_eq!(h.engine.proposals(), 0);
}

#[tokio::test]
async fn invalid_commands_never_reach_the_engine() {
    let h = default_harness();
    h.leadership.become_leader().await;

    let err = h.writes.put(Vec::new(), b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, WriteError::Invalid(CodecError::EmptyKey)));
    assert_eq!(h.engine.proposals(), 0);
}

#[tokio::test]
async fn commit_timeout_reports_unknown_outcome() -> Result<()> {
    let h = harness(Duration::from_millis(50), Duration::from_secs(2));
    h.leadership.become_leader().await;
    h.engine.set_mode(Mode::Park);

    let err = h.writes.put(b"k".to_vec(), b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, WriteError::CommitTimeout { .. }));
    assert!(err.outcome_unknown());

    // The engine still owns the proposal and may commit it later.
    h.engine.release_parked();
    assert_eq!(h.sm.get(b"k")?, Some(b"v".to_vec()));
    Ok(())
}

#[tokio::test]
async fn overwritten_proposal_is_rejected() {
    let h = default_harness();
    h.leadership.become_leader().await;
    h.engine.set_mode(Mode::Supersede);

    let err = h.writes.put(b"k".to_vec(), b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, WriteError::Rejected { .. }));
    assert!(!err.outcome_unknown());
}

#[tokio::test]
async fn abandoned_proposal_is_an_unknown_outcome() {
    let h = default_harness();
    h.leadership.become_leader().await;
    h.engine.set_mode(Mode::Abandon);

    let err = h.writes.put(b"k".to_vec(), b"v".to_vec()).await.unwrap_err();
    assert!(matches!(err, WriteError::Engine(ProposeError::Abandoned)));
    assert!(err.outcome_unknown());
}

#[tokio::test]
async fn engine_refusal_becomes_a_redirect() {
    let h = default_harness();
    h.leadership.become_leader().await;
    // The engine lost leadership before the monitor heard about it.
    h.engine.set_mode(Mode::NotLeader);

    let err = h.writes.handle_write(Command::put("k", "v")).await.unwrap_err();
    assert!(matches!(err, WriteError::NotLeader { leader: None }));
    assert_eq!(h.engine.proposals(), 1);
    assert_eq!(h.sm.applied_index(), 0);
}

#[tokio::test]
async fn leadership_flip_mid_flight_applies_once() -> Result<()> {
    let h = Arc::new(harness(Duration::from_millis(200), Duration::from_secs(2)));
    h.leadership.become_leader().await;
    h.engine.set_mode(Mode::Park);

    let inflight = {
        let h = h.clone();
        tokio::spawn(async move { h.writes.put(b"k".to_vec(), b"v1".to_vec()).await })
    };
    h.engine.wait_parked(1).await;

    h.leadership.follow(Some((2, LEADER_API))).await;
    let retry = h.writes.put(b"k".to_vec(), b"v1".to_vec()).await.unwrap_err();
    assert!(matches!(retry, WriteError::NotLeader { .. }));

    // The old leader's entry commits after all.
    h.engine.release_parked();
    let first = inflight.await?;
    assert!(matches!(first, Err(WriteError::CommitTimeout { .. })));

    assert_eq!(h.engine.proposals(), 1);
    assert_eq!(h.sm.applied_index(), 1);
    assert_eq!(h.sm.get(b"k")?, Some(b"v1".to_vec()));
    Ok(())
}

#[tokio::test]
async fn reordered_delivery_is_refused() -> Result<()> {
    let h = default_harness();
    h.leadership.become_leader().await;
    h.engine.set_mode(Mode::Park);

    let writes = Arc::new(h);
    for value in ["first", "second"] {
        let writes = writes.clone();
        tokio::spawn(async move { writes.writes.put(b"k".to_vec(), value.into()).await });
    }
    writes.engine.wait_parked(2).await;

    let mut parked = writes.engine.take_parked();
    parked.sort_by_key(|(index, _)| *index);
    let (first, second) = (&parked[0], &parked[1]);
    writes.sm.apply(second.0, &second.1)?;
    let err = writes.sm.apply(first.0, &first.1).unwrap_err();
    assert!(matches!(err, ApplyError::OutOfOrder { .. }));
    assert_eq!(writes.sm.applied_index(), second.0);
    Ok(())
}

#[tokio::test]
async fn local_reads_are_served_anywhere() -> Result<()> {
    let h = default_harness();
    h.leadership.become_leader().await;
    h.writes.put(b"k".to_vec(), b"v".to_vec()).await?;
    h.leadership.follow(Some((2, LEADER_API))).await;

    assert_eq!(
        h.reads.handle_read(b"k", Consistency::Local).await?,
        Some(b"v".to_vec())
    );
    assert_eq!(h.reads.handle_read(b"missing", Consistency::Local).await?, None);
    Ok(())
}

#[tokio::test]
async fn strong_reads_need_the_leader() -> Result<()> {
    let h = default_harness();
    h.leadership.become_leader().await;
    h.writes.put(b"k".to_vec(), b"v".to_vec()).await?;

    assert_eq!(
        h.reads.handle_read(b"k", Consistency::Strong).await?,
        Some(b"v".to_vec())
    );

    h.leadership.follow(Some((2, LEADER_API))).await;
    let err = h.reads.handle_read(b"k", Consistency::Strong).await.unwrap_err();
    match err {
        ReadError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some(LEADER_API)),
        other => panic!("expected a redirect, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn strong_read_waits_for_the_read_index() -> Result<()> {
    let h = harness(Duration::from_secs(5), Duration::from_millis(100));
    h.leadership.become_leader().await;
    h.writes.put(b"k".to_vec(), b"old".to_vec()).await?;

    // The cluster committed index 2 but it has not been applied here yet.
    h.engine.set_read_index(Ok(2));
    let err = h.reads.handle_read(b"k", Consistency::Strong).await.unwrap_err();
    assert!(matches!(err, ReadError::Timeout { .. }));

    let reader = {
        let sm = h.sm.clone();
        let read = h.reads.handle_read(b"k", Consistency::Strong);
        let apply = async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sm.apply(2, &Command::put("k", "new").encode().unwrap())
        };
        tokio::join!(read, apply)
    };
    reader.1?;
    assert_eq!(reader.0?, Some(b"new".to_vec()));
    Ok(())
}
