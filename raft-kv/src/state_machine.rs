//! The replicated state machine.
//!
//! [`StateMachine`] applies committed commands to the local store in log
//! order, and can serialize the whole dataset into a snapshot or replace it
//! from one. It is shared between the consensus worker (the only caller of
//! [`StateMachine::apply`]) and the request path (reads, freshness waits).
//!
//! # Snapshot format
//!
//! A header `{ version, index, entries }` followed by `entries` records of
//! `(key, value)` in ascending key order, each bincode-encoded, then end of
//! stream. Equal datasets at equal indexes produce identical bytes.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;

use bincode::Options;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::error::Elapsed;
use tracing::{debug, info};

use crate::command::Command;
use crate::error::{ApplyError, RestoreError, SnapshotError, StorageError};
use crate::store::{KvStore, MemoryStore};

const SNAPSHOT_V1: u8 = 1;

/// Largest single record accepted while reading a snapshot.
const MAX_RECORD_BYTES: u64 = 256 * 1024 * 1024;

fn snapshot_codec() -> impl Options {
    // Records are read one at a time from a stream; the end-of-stream check
    // in `read_snapshot` replaces bincode's trailing-byte check.
    bincode::DefaultOptions::new()
        .with_limit(MAX_RECORD_BYTES)
        .allow_trailing_bytes()
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    version: u8,
    index: u64,
    entries: u64,
}

#[derive(Serialize)]
struct RecordRef<'a> {
    #[serde(with = "serde_bytes")]
    key: &'a [u8],
    #[serde(with = "serde_bytes")]
    value: &'a [u8],
}

#[derive(Deserialize)]
struct Record {
    #[serde(with = "serde_bytes")]
    key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    value: Vec<u8>,
}

/// Records details when a command is applied to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub index: u64,
    pub command: Command,
}

struct Inner {
    store: Box<dyn KvStore>,
    last_applied: u64,
}

pub struct StateMachine {
    inner: RwLock<Inner>,
    applied_tx: watch::Sender<u64>,
}

impl StateMachine {
    pub fn new(store: impl KvStore + 'static) -> Self {
        let (applied_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                store: Box::new(store),
                last_applied: 0,
            }),
            applied_tx,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Applies the committed entry at `index`.
    ///
    /// Indexes must be strictly increasing across calls. Gaps are fine: the
    /// engine does not deliver entries that carry no command. An entry at or
    /// below the last applied index is refused without touching the store.
    pub fn apply(&self, index: u64, payload: &[u8]) -> Result<Applied, ApplyError> {
        let mut inner = self.inner.write();
        if index <= inner.last_applied {
            return Err(ApplyError::OutOfOrder {
                index,
                last_applied: inner.last_applied,
            });
        }

        let command =
            Command::decode(payload).map_err(|source| ApplyError::Corrupt { index, source })?;
        let result = match &command {
            Command::Put { key, value } => inner.store.put(key.clone(), value.clone()),
            Command::Delete { key } => inner.store.delete(key),
        };
        result.map_err(|source| ApplyError::Storage { index, source })?;
        inner.last_applied = index;
        drop(inner);

        self.applied_tx.send_replace(index);
        debug!(index, key_len = command.key().len(), "applied command");
        Ok(Applied { index, command })
    }

    /// Records that the committed entry at `index` carried no command (a
    /// leader's no-op or a configuration entry), so freshness waits on it
    /// complete. Ordering rules are the same as for [`StateMachine::apply`].
    pub fn apply_noop(&self, index: u64) -> Result<(), ApplyError> {
        let mut inner = self.inner.write();
        if index <= inner.last_applied {
            return Err(ApplyError::OutOfOrder {
                index,
                last_applied: inner.last_applied,
            });
        }
        inner.last_applied = index;
        drop(inner);

        self.applied_tx.send_replace(index);
        Ok(())
    }

    /// Reads the locally applied value for `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.read().store.get(key)
    }

    pub fn applied_index(&self) -> u64 {
        self.inner.read().last_applied
    }

    /// Waits until everything up to `index` has been applied locally.
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> Result<(), Elapsed> {
        let mut applied = self.applied_tx.subscribe();
        tokio::time::timeout(timeout, async move {
            // The sender lives as long as `self`, so the wait cannot fail.
            let _ = applied.wait_for(|applied| *applied >= index).await;
        })
        .await
    }

    /// Captures a consistent copy of the dataset.
    ///
    /// The read lock is held only while the pairs are copied out, so an
    /// apply waits at most for one pass over the store.
    pub fn snapshot(&self) -> Result<SnapshotHandle, SnapshotError> {
        let inner = self.inner.read();
        let entries = inner.store.iter_all()?.collect::<Result<Vec<_>, _>>()?;
        Ok(SnapshotHandle {
            index: inner.last_applied,
            entries,
        })
    }

    /// Replaces the dataset with the one in `source`.
    ///
    /// The snapshot is decoded and validated in full before the store is
    /// touched. Ingestion then happens under the write lock; if the store
    /// fails part way, the previous pairs are written back before the lock is
    /// released, so readers never observe a partially restored dataset.
    pub fn restore<R: Read>(&self, source: R) -> Result<u64, RestoreError> {
        let (index, staging) = read_snapshot(source)?;
        let restored = staging.len();

        let mut inner = self.inner.write();
        let previous = inner.store.iter_all()?.collect::<Result<Vec<_>, _>>()?;
        if let Err(err) = ingest(inner.store.as_mut(), staging) {
            return match ingest(inner.store.as_mut(), previous) {
                Ok(()) => Err(RestoreError::Storage(err)),
                Err(rollback) => Err(RestoreError::Unrecoverable(rollback)),
            };
        }
        inner.last_applied = index;
        drop(inner);

        self.applied_tx.send_replace(index);
        info!(index, entries = restored, "restored state machine from snapshot");
        Ok(index)
    }
}

fn ingest(
    store: &mut dyn KvStore,
    entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
) -> Result<(), StorageError> {
    store.clear()?;
    for (key, value) in entries {
        store.put(key, value)?;
    }
    Ok(())
}

fn read_snapshot<R: Read>(mut source: R) -> Result<(u64, BTreeMap<Vec<u8>, Vec<u8>>), RestoreError> {
    let header: SnapshotHeader = snapshot_codec().deserialize_from(&mut source)?;
    if header.version != SNAPSHOT_V1 {
        return Err(RestoreError::UnsupportedVersion(header.version));
    }

    let mut staging = BTreeMap::new();
    for _ in 0..header.entries {
        let record: Record = snapshot_codec().deserialize_from(&mut source)?;
        if record.key.is_empty() {
            return Err(RestoreError::EmptyKey);
        }
        if staging.insert(record.key, record.value).is_some() {
            return Err(RestoreError::DuplicateKey);
        }
    }

    let mut probe = [0u8; 1];
    if source.read(&mut probe)? != 0 {
        return Err(RestoreError::TrailingBytes);
    }
    Ok((header.index, staging))
}

/// A point-in-time copy of the dataset, taken by [`StateMachine::snapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    index: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SnapshotHandle {
    /// Index of the last command included in the snapshot.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Streams the snapshot into `sink`.
    pub fn persist<W: Write>(&self, mut sink: W) -> Result<(), SnapshotError> {
        let header = SnapshotHeader {
            version: SNAPSHOT_V1,
            index: self.index,
            entries: self.entries.len() as u64,
        };
        snapshot_codec().serialize_into(&mut sink, &header)?;
        for (key, value) in &self.entries {
            snapshot_codec().serialize_into(&mut sink, &RecordRef { key, value })?;
        }
        sink.flush()?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut out = Vec::new();
        self.persist(&mut out)?;
        Ok(out)
    }

    /// Frees the copied dataset.
    pub fn release(self) {}
}
