//! Log-structured store with snapshot-at-sequence reads and a tailable WAL.
//!
//! Durable latest state lives in fjall partitions, one per column. The
//! versioned view needed for pinned snapshots and the batch-granular WAL tail
//! are kept in memory: every write batch gets a contiguous run of sequence
//! numbers, each entry records one version, and snapshots pin a sequence so
//! version GC cannot reclaim what an open iterator may still read.
//!
//! Migrations do not survive a restart, so the WAL tail is not persisted;
//! recovery reloads the latest state from fjall at sequence zero.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::encoding::{Metadata, METADATA_HEADER_LEN};

/// Storage columns. Handles are owned by the store and never cached by
/// callers, so a close/reopen cannot leave anyone holding a stale handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Metadata,
    Subkey,
    Stream,
}

impl Column {
    pub const ALL: [Column; 3] = [Column::Metadata, Column::Subkey, Column::Stream];

    fn partition_name(self) -> &'static str {
        match self {
            Column::Metadata => "metadata",
            Column::Subkey => "subkey",
            Column::Stream => "stream",
        }
    }

    fn index(self) -> usize {
        match self {
            Column::Metadata => 0,
            Column::Subkey => 1,
            Column::Stream => 2,
        }
    }
}

/// Who produced a write. Lazy-expire deletions are suppressed by the
/// migration batch decoder but propagated to replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    Client,
    Expiration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Put,
    Delete,
}

/// One mutation inside a write batch; consumes one WAL sequence number.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub column: Column,
    pub op: WriteOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub origin: WriteOrigin,
}

/// Command tag a write path stamps onto its batch. The migration decoder
/// dispatches on it the way the original attached log data to each batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchHint {
    None,
    Set,
    Del,
    Expire,
    RPush,
    LPop,
    HSet,
    HDel,
    SAdd,
    SRem,
    ZAdd,
    ZRem,
    SiAdd,
    SiRem,
    SetBit { offset: u64, value: bool },
    XAdd,
}

/// Batch under construction by a write path.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub hint: BatchHint,
    pub entries: Vec<WalEntry>,
}

impl WriteBatch {
    pub fn new(hint: BatchHint) -> Self {
        Self {
            hint,
            entries: Vec::new(),
        }
    }

    pub fn put(&mut self, column: Column, key: Vec<u8>, value: Vec<u8>) {
        self.entries.push(WalEntry {
            column,
            op: WriteOp::Put,
            key,
            value,
            origin: WriteOrigin::Client,
        });
    }

    pub fn delete(&mut self, column: Column, key: Vec<u8>) {
        self.delete_with_origin(column, key, WriteOrigin::Client);
    }

    pub fn delete_with_origin(&mut self, column: Column, key: Vec<u8>, origin: WriteOrigin) {
        self.entries.push(WalEntry {
            column,
            op: WriteOp::Delete,
            key,
            value: Vec::new(),
            origin,
        });
    }
}

/// A committed batch as seen by the WAL tail.
#[derive(Debug, Clone)]
pub struct WalBatch {
    /// Sequence of the first entry; entry `i` sits at `first_seq + i`.
    pub first_seq: u64,
    pub hint: BatchHint,
    pub entries: Vec<WalEntry>,
}

impl WalBatch {
    pub fn last_seq(&self) -> u64 {
        self.first_seq + self.entries.len().saturating_sub(1) as u64
    }

    /// Sequence the next batch must start at.
    pub fn next_seq(&self) -> u64 {
        self.first_seq + self.entries.len() as u64
    }
}

#[derive(Debug, Clone)]
struct VersionedValue {
    seq: u64,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct ColumnState {
    records: BTreeMap<Vec<u8>, Vec<VersionedValue>>,
}

struct StoreState {
    columns: [ColumnState; 3],
    wal: VecDeque<WalBatch>,
}

pub struct Store {
    keyspace: Keyspace,
    partitions: [PartitionHandle; 3],
    state: RwLock<StoreState>,
    /// Serializes read-modify-write write paths (single writer).
    write_lock: Mutex<()>,
    latest_seq: AtomicU64,
    version_counter: AtomicU64,
    /// Pinned snapshot sequences with reference counts.
    pins: Mutex<BTreeMap<u64, usize>>,
    snapshots_acquired: AtomicU64,
    snapshots_released: AtomicU64,
}

impl Store {
    /// Open (or create) the store under `path` and reload latest state.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Arc<Self>> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open keyspace")?;

        let mut handles = Vec::with_capacity(Column::ALL.len());
        for column in Column::ALL {
            let handle = keyspace
                .open_partition(column.partition_name(), PartitionCreateOptions::default())
                .with_context(|| format!("open partition {}", column.partition_name()))?;
            handles.push(handle);
        }
        let partitions: [PartitionHandle; 3] = handles
            .try_into()
            .map_err(|_| anyhow::anyhow!("partition handle arity"))?;

        let mut state = StoreState {
            columns: Default::default(),
            wal: VecDeque::new(),
        };
        let mut max_version = 0u64;
        for column in Column::ALL {
            let records = &mut state.columns[column.index()].records;
            for item in partitions[column.index()].range(Vec::new()..) {
                let (key, value) = item.context("recover latest state")?;
                if column == Column::Metadata && value.len() >= METADATA_HEADER_LEN {
                    if let Ok(meta) = Metadata::decode(&value) {
                        max_version = max_version.max(meta.version);
                    }
                }
                records.insert(
                    key.to_vec(),
                    vec![VersionedValue {
                        seq: 0,
                        value: Some(value.to_vec()),
                    }],
                );
            }
        }

        Ok(Arc::new(Self {
            keyspace,
            partitions,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
            latest_seq: AtomicU64::new(0),
            version_counter: AtomicU64::new(max_version + 1),
            pins: Mutex::new(BTreeMap::new()),
            snapshots_acquired: AtomicU64::new(0),
            snapshots_released: AtomicU64::new(0),
        }))
    }

    pub fn latest_sequence(&self) -> u64 {
        self.latest_seq.load(Ordering::Acquire)
    }

    /// Open an auxiliary partition in this store's keyspace. Callers fetch
    /// handles through here instead of caching them.
    pub fn open_partition(&self, name: &str) -> anyhow::Result<PartitionHandle> {
        self.keyspace
            .open_partition(name, PartitionCreateOptions::default())
            .with_context(|| format!("open partition {name}"))
    }

    /// Allocate a fresh record version.
    pub fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Guard that serializes read-modify-write write paths.
    pub fn write_serial(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Commit a batch: assign sequences, append to the WAL tail, update the
    /// versioned view, and mirror the latest state into fjall.
    pub fn apply(&self, batch: WriteBatch) -> anyhow::Result<u64> {
        if batch.entries.is_empty() {
            return Ok(self.latest_sequence());
        }

        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        // Read pins under the state lock: a snapshot pins while holding the
        // read side, so the floor seen here can never miss a live pin.
        let gc_floor = {
            let pins = self.pins.lock().unwrap_or_else(|p| p.into_inner());
            pins.keys().next().copied()
        };
        let first_seq = self.latest_seq.load(Ordering::Acquire) + 1;

        let mut disk = self.keyspace.batch();
        for (idx, entry) in batch.entries.iter().enumerate() {
            let seq = first_seq + idx as u64;
            let column = &mut state.columns[entry.column.index()];
            let versions = column.records.entry(entry.key.clone()).or_default();
            versions.push(VersionedValue {
                seq,
                value: match entry.op {
                    WriteOp::Put => Some(entry.value.clone()),
                    WriteOp::Delete => None,
                },
            });
            prune_versions(versions, gc_floor.unwrap_or(u64::MAX));

            let partition = &self.partitions[entry.column.index()];
            match entry.op {
                WriteOp::Put => disk.insert(partition, entry.key.clone(), entry.value.clone()),
                WriteOp::Delete => disk.remove(partition, entry.key.clone()),
            }
        }
        disk.commit().context("persist batch")?;

        let last_seq = first_seq + batch.entries.len() as u64 - 1;
        state.wal.push_back(WalBatch {
            first_seq,
            hint: batch.hint,
            entries: batch.entries,
        });

        // Drop WAL batches nothing can pin anymore.
        let wal_floor = gc_floor.unwrap_or(last_seq);
        while let Some(front) = state.wal.front() {
            if front.last_seq() <= wal_floor {
                state.wal.pop_front();
            } else {
                break;
            }
        }

        self.latest_seq.store(last_seq, Ordering::Release);
        Ok(first_seq)
    }

    /// Latest visible value for `key`.
    pub fn get(&self, column: Column, key: &[u8]) -> Option<Vec<u8>> {
        self.get_at(column, key, u64::MAX)
    }

    /// Newest value at or below `seq`.
    pub fn get_at(&self, column: Column, key: &[u8], seq: u64) -> Option<Vec<u8>> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        let versions = state.columns[column.index()].records.get(key)?;
        visible_at(versions, seq).cloned()
    }

    /// Pin the current sequence and hand out a snapshot bound to it.
    pub fn snapshot(self: &Arc<Self>) -> Snapshot {
        // Hold the read side so no in-flight apply can GC between reading
        // the sequence and registering the pin.
        let _state = self.state.read().unwrap_or_else(|p| p.into_inner());
        let seq = self.latest_sequence();
        {
            let mut pins = self.pins.lock().unwrap_or_else(|p| p.into_inner());
            *pins.entry(seq).or_insert(0) += 1;
        }
        self.snapshots_acquired.fetch_add(1, Ordering::Relaxed);
        Snapshot {
            store: Arc::clone(self),
            seq,
        }
    }

    /// Clone the committed batches whose range ends at or after `from_seq`.
    pub fn wal_batches(&self, from_seq: u64) -> Vec<WalBatch> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        state
            .wal
            .iter()
            .filter(|batch| batch.last_seq() >= from_seq)
            .cloned()
            .collect()
    }

    /// Snapshots handed out minus snapshots released; zero when idle.
    pub fn active_snapshots(&self) -> u64 {
        self.snapshots_acquired
            .load(Ordering::Relaxed)
            .saturating_sub(self.snapshots_released.load(Ordering::Relaxed))
    }

    pub fn snapshots_acquired(&self) -> u64 {
        self.snapshots_acquired.load(Ordering::Relaxed)
    }

    pub fn snapshots_released(&self) -> u64 {
        self.snapshots_released.load(Ordering::Relaxed)
    }

    fn unpin(&self, seq: u64) {
        let mut pins = self.pins.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = pins.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&seq);
            }
        }
        drop(pins);
        self.snapshots_released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Consistent read view pinned at one sequence. Iterators borrow the
/// snapshot, so they can never outlive the pin.
pub struct Snapshot {
    store: Arc<Store>,
    seq: u64,
}

impl Snapshot {
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Cursor iterator over `prefix` in `column` as of this snapshot.
    /// Each step takes the read lock briefly, so writers are not held up
    /// for the duration of a scan.
    pub fn scan_prefix<'a>(&'a self, column: Column, prefix: &[u8]) -> PrefixScan<'a> {
        PrefixScan {
            snapshot: self,
            column,
            prefix: prefix.to_vec(),
            cursor: None,
            done: false,
        }
    }

    pub fn get(&self, column: Column, key: &[u8]) -> Option<Vec<u8>> {
        self.store.get_at(column, key, self.seq)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.store.unpin(self.seq);
    }
}

pub struct PrefixScan<'a> {
    snapshot: &'a Snapshot,
    column: Column,
    prefix: Vec<u8>,
    cursor: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for PrefixScan<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let store = &self.snapshot.store;
        let state = store.state.read().unwrap_or_else(|p| p.into_inner());
        let records = &state.columns[self.column.index()].records;

        let lower = match &self.cursor {
            Some(last) => Bound::Excluded(last.clone()),
            None => Bound::Included(self.prefix.clone()),
        };
        for (key, versions) in records.range((lower, Bound::Unbounded)) {
            // Guard against walking past the prefix range.
            if !key.starts_with(&self.prefix) {
                self.done = true;
                return None;
            }
            if let Some(value) = visible_at(versions, self.snapshot.seq) {
                let item = (key.clone(), value.clone());
                self.cursor = Some(key.clone());
                return Some(item);
            }
            // Invisible at this sequence; remember it and keep walking.
            self.cursor = Some(key.clone());
        }
        self.done = true;
        None
    }
}

/// Newest non-tombstone value at or below `seq`.
fn visible_at(versions: &[VersionedValue], seq: u64) -> Option<&Vec<u8>> {
    versions
        .iter()
        .rev()
        .find(|v| v.seq <= seq)
        .and_then(|v| v.value.as_ref())
}

/// Keep every version above `floor` plus the newest one at or below it.
fn prune_versions(versions: &mut Vec<VersionedValue>, floor: u64) {
    let keep_from = versions
        .iter()
        .rposition(|v| v.seq <= floor)
        .unwrap_or(0);
    if keep_from > 0 {
        versions.drain(..keep_from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::Builder::new()
            .prefix(name)
            .tempdir()
            .expect("create temp dir");
        let store = Store::open(dir.path()).expect("open store");
        (store, dir)
    }

    fn put_batch(key: &[u8], value: &[u8]) -> WriteBatch {
        let mut batch = WriteBatch::new(BatchHint::Set);
        batch.put(Column::Metadata, key.to_vec(), value.to_vec());
        batch
    }

    #[test]
    fn sequences_are_contiguous_across_batches() {
        let (store, _dir) = temp_store("store_seq");
        let first = store.apply(put_batch(b"a", b"1")).expect("apply");
        assert_eq!(first, 1);
        let mut batch = WriteBatch::new(BatchHint::None);
        batch.put(Column::Metadata, b"b".to_vec(), b"2".to_vec());
        batch.put(Column::Metadata, b"c".to_vec(), b"3".to_vec());
        let second = store.apply(batch).expect("apply");
        assert_eq!(second, 2);
        assert_eq!(store.latest_sequence(), 3);
    }

    #[test]
    fn snapshot_does_not_see_later_writes() {
        let (store, _dir) = temp_store("store_snapshot");
        store.apply(put_batch(b"k", b"old")).expect("apply");
        let snapshot = store.snapshot();
        store.apply(put_batch(b"k", b"new")).expect("apply");
        store.apply(put_batch(b"fresh", b"x")).expect("apply");

        assert_eq!(snapshot.get(Column::Metadata, b"k"), Some(b"old".to_vec()));
        assert_eq!(snapshot.get(Column::Metadata, b"fresh"), None);
        assert_eq!(store.get(Column::Metadata, b"k"), Some(b"new".to_vec()));
    }

    #[test]
    fn prefix_scan_stops_at_prefix_boundary() {
        let (store, _dir) = temp_store("store_scan");
        store.apply(put_batch(b"aa1", b"1")).expect("apply");
        store.apply(put_batch(b"aa2", b"2")).expect("apply");
        store.apply(put_batch(b"ab1", b"3")).expect("apply");
        let snapshot = store.snapshot();
        let keys: Vec<Vec<u8>> = snapshot
            .scan_prefix(Column::Metadata, b"aa")
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"aa1".to_vec(), b"aa2".to_vec()]);
    }

    #[test]
    fn wal_is_retained_while_pinned_and_dropped_after() {
        let (store, _dir) = temp_store("store_wal_gc");
        store.apply(put_batch(b"seed", b"0")).expect("apply");
        let snapshot = store.snapshot();
        store.apply(put_batch(b"k1", b"1")).expect("apply");
        store.apply(put_batch(b"k2", b"2")).expect("apply");

        let batches = store.wal_batches(snapshot.sequence() + 1);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].first_seq, snapshot.sequence() + 1);
        assert_eq!(batches[1].first_seq, batches[0].next_seq());

        drop(snapshot);
        // Next apply GCs everything below the (now absent) pin.
        store.apply(put_batch(b"k3", b"3")).expect("apply");
        assert!(store.wal_batches(1).is_empty());
    }

    #[test]
    fn snapshot_counters_balance() {
        let (store, _dir) = temp_store("store_pins");
        {
            let _a = store.snapshot();
            let _b = store.snapshot();
            assert_eq!(store.active_snapshots(), 2);
        }
        assert_eq!(store.active_snapshots(), 0);
        assert_eq!(store.snapshots_acquired(), store.snapshots_released());
    }

    #[test]
    fn tombstones_hide_keys_from_scans() {
        let (store, _dir) = temp_store("store_tombstone");
        store.apply(put_batch(b"aa1", b"1")).expect("apply");
        let mut del = WriteBatch::new(BatchHint::Del);
        del.delete(Column::Metadata, b"aa1".to_vec());
        store.apply(del).expect("apply");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scan_prefix(Column::Metadata, b"aa").count(), 0);
    }

    #[test]
    fn reopen_recovers_latest_state() {
        let dir = tempfile::tempdir().expect("create temp dir");
        {
            let store = Store::open(dir.path()).expect("open store");
            store.apply(put_batch(b"persisted", b"v")).expect("apply");
        }
        let store = Store::open(dir.path()).expect("reopen store");
        assert_eq!(
            store.get(Column::Metadata, b"persisted"),
            Some(b"v".to_vec())
        );
        // The WAL tail does not survive a restart.
        assert_eq!(store.latest_sequence(), 0);
    }
}
