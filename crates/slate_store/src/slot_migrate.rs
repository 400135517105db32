//! Live migration of one slot to a peer node.
//!
//! A single background worker drives one job at a time through
//! Start -> Snapshot -> WAL -> Success/Failed -> Clean. The snapshot phase
//! replays a pinned view of the slot as restore commands; the WAL phase
//! tails committed batches until source and destination converge, takes the
//! work-exclusivity latch to forbid new writes to the slot, and ships the
//! last delta. Cancellation is cooperative: the stop flag is polled at every
//! scan step, every tailed batch, and the entry of every pipeline flush.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::batch::{stream_add_args, BatchDecoder};
use crate::cluster::SlotOwner;
use crate::encoding::{
    now_ms, slot_prefix, split_metadata_key, split_subkey, subkey_prefix, Metadata, RecordKind,
    StreamTrailer, METADATA_HEADER_LEN,
};
use crate::error::{MigrateError, MigrateResult};
use crate::pipeline::{CommandEmitter, CommandPipeline};
use crate::resp::format_double;
use crate::store::{Column, Snapshot};
use crate::writes::{bitmap_offset, decode_chunk_index};
use crate::NodeContext;

/// Elements accumulated per restore command for collection kinds.
const MAX_ITEMS_PER_COMMAND: usize = 16;
/// Convergence rounds before the cutover is taken regardless of gap.
const MAX_WAL_EPOCHS: u32 = 10;

const IMPORT_START: u8 = 0;
const IMPORT_SUCCESS: u8 = 1;
const IMPORT_FAILED: u8 = 2;

/// Outcome reported by the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationState {
    None = 0,
    Started = 1,
    Success = 2,
    Failed = 3,
}

/// Stage of the running state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrationStage {
    None = 0,
    Start = 1,
    Snapshot = 2,
    Wal = 3,
    Success = 4,
    Failed = 5,
    Clean = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMigrationResult {
    Migrated,
    Expired,
    Empty,
}

/// Immutable description of one migration job.
#[derive(Debug, Clone)]
pub struct MigrationJob {
    pub slot: u16,
    pub dst_node_id: String,
    pub dst_addr: String,
    /// Commands per second; zero disables the limit.
    pub max_speed: u64,
    pub pipeline_size: usize,
    pub seq_gap_limit: u64,
}

enum WorkerCommand {
    Run(MigrationJob),
    Shutdown,
}

struct MigratorShared {
    ctx: Arc<NodeContext>,
    state: AtomicU8,
    stage: AtomicU8,
    stop: Arc<AtomicBool>,
    dst_node: Mutex<String>,
}

impl MigratorShared {
    fn set_stage(&self, stage: MigrationStage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    fn set_state(&self, state: MigrationState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Owner of the migration worker thread. One per node, alive for the
/// process lifetime.
pub struct SlotMigrator {
    shared: Arc<MigratorShared>,
    tx: mpsc::Sender<WorkerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SlotMigrator {
    /// Spawn the worker thread. A node running as a replica starts with the
    /// stop flag raised so a submitted job can never make progress.
    pub fn spawn(ctx: Arc<NodeContext>) -> anyhow::Result<Self> {
        let shared = Arc::new(MigratorShared {
            stop: Arc::new(AtomicBool::new(ctx.config.replica)),
            ctx,
            state: AtomicU8::new(MigrationState::None as u8),
            stage: AtomicU8::new(MigrationStage::None as u8),
            dst_node: Mutex::new(String::new()),
        });

        let (tx, rx) = mpsc::channel();
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("slot-migrate".to_string())
            .spawn(move || worker_loop(worker_shared, rx))?;

        Ok(Self {
            shared,
            tx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Submit a migration job. At most one job exists at a time; a slot
    /// that already migrated off this node is rejected, a previously failed
    /// slot may be retried. Non-positive speed disables the rate limit;
    /// non-positive pipeline size or gap fall back to the configured values.
    pub fn perform_slot_migration(
        &self,
        node_id: &str,
        dst_addr: &str,
        slot: u16,
        speed: i64,
        pipeline_size: i64,
        seq_gap: i64,
    ) -> anyhow::Result<()> {
        let gate = &self.shared.ctx.gate;
        if !gate.try_begin(slot) {
            anyhow::bail!("there is already a migrating slot");
        }
        if gate.forbidden_slot() == Some(slot) {
            gate.end();
            anyhow::bail!("can't migrate a slot which has been migrated");
        }

        let config = &self.shared.ctx.config;
        let job = MigrationJob {
            slot,
            dst_node_id: node_id.to_string(),
            dst_addr: dst_addr.to_string(),
            max_speed: if speed <= 0 { 0 } else { speed as u64 },
            pipeline_size: if pipeline_size <= 0 {
                config.migrate_pipeline_size
            } else {
                pipeline_size as usize
            },
            seq_gap_limit: if seq_gap <= 0 {
                config.migrate_sequence_gap
            } else {
                seq_gap as u64
            },
        };

        self.shared.set_state(MigrationState::Started);
        {
            let mut dst_node = self
                .shared
                .dst_node
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            *dst_node = node_id.to_string();
        }
        gate.set_destination(Some(dst_addr.to_string()));

        tracing::info!(
            slot,
            destination = dst_addr,
            max_speed = job.max_speed,
            pipeline_size = job.pipeline_size,
            "start migrating slot"
        );

        if self.tx.send(WorkerCommand::Run(job)).is_err() {
            gate.end();
            anyhow::bail!("migration worker is gone");
        }
        Ok(())
    }

    /// Submit with the node's configured speed, pipeline width, and gap.
    pub fn migrate_slot(&self, node_id: &str, dst_addr: &str, slot: u16) -> anyhow::Result<()> {
        let config = &self.shared.ctx.config;
        self.perform_slot_migration(
            node_id,
            dst_addr,
            slot,
            config.migrate_speed as i64,
            config.migrate_pipeline_size as i64,
            config.migrate_sequence_gap as i64,
        )
    }

    /// Raise or clear the cooperative stop flag. Raised on role change to
    /// replica, administrative abort, and before the store is closed.
    pub fn set_stop_migration_flag(&self, value: bool) {
        self.shared.stop.store(value, Ordering::Release);
    }

    /// Administrative abort of the running job.
    pub fn cancel(&self) {
        self.set_stop_migration_flag(true);
    }

    /// Cancel and busy-wait until the stage returns to `None`, as the
    /// server does before closing the store underneath the migrator.
    pub fn cancel_and_wait(&self, timeout: Duration) -> bool {
        self.set_stop_migration_flag(true);
        let deadline = Instant::now() + timeout;
        while self.current_stage() != MigrationStage::None {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    pub fn is_migration_in_progress(&self) -> bool {
        self.state() == MigrationState::Started
    }

    pub fn state(&self) -> MigrationState {
        match self.shared.state.load(Ordering::Acquire) {
            1 => MigrationState::Started,
            2 => MigrationState::Success,
            3 => MigrationState::Failed,
            _ => MigrationState::None,
        }
    }

    pub fn current_stage(&self) -> MigrationStage {
        match self.shared.stage.load(Ordering::Acquire) {
            1 => MigrationStage::Start,
            2 => MigrationStage::Snapshot,
            3 => MigrationStage::Wal,
            4 => MigrationStage::Success,
            5 => MigrationStage::Failed,
            6 => MigrationStage::Clean,
            _ => MigrationStage::None,
        }
    }

    /// Clear the forbidden register once topology has propagated.
    pub fn release_forbidden_slot(&self) {
        let gate = &self.shared.ctx.gate;
        if let Some(slot) = gate.forbidden_slot() {
            tracing::info!(slot, "release forbidden slot");
        }
        gate.release_forbidden();
    }

    /// Status triple for the admin surface. Empty while nothing has run.
    /// The reported slot is the running slot while started, the migrated
    /// slot after success, and the failed slot after a failure.
    pub fn migration_info(&self) -> String {
        let gate = &self.shared.ctx.gate;
        if gate.migrating_slot().is_none()
            && gate.forbidden_slot().is_none()
            && gate.failed_slot().is_none()
        {
            return String::new();
        }

        let (state, slot) = match self.state() {
            MigrationState::None => ("none", None),
            MigrationState::Started => ("start", gate.migrating_slot()),
            MigrationState::Success => ("success", gate.forbidden_slot()),
            MigrationState::Failed => ("fail", gate.failed_slot()),
        };
        let slot = slot.map(i64::from).unwrap_or(-1);
        let dst_node = self
            .shared
            .dst_node
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        format!(
            "migrating_slot: {slot}\r\ndestination_node: {dst_node}\r\nmigrating_state: {state}\r\n"
        )
    }
}

impl Drop for SlotMigrator {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        let _ = self.tx.send(WorkerCommand::Shutdown);
        let handle = {
            let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
            worker.take()
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("slot migration thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(shared: Arc<MigratorShared>, rx: mpsc::Receiver<WorkerCommand>) {
    loop {
        match rx.recv() {
            Ok(WorkerCommand::Run(job)) => run_state_machine(&shared, job),
            Ok(WorkerCommand::Shutdown) | Err(_) => return,
        }
    }
}

/// Per-run resources. The snapshot and socket live here so every exit path
/// funnels through Clean, which releases them exactly once.
struct MigrationSession {
    job: MigrationJob,
    snapshot: Option<Snapshot>,
    pipeline: Option<CommandPipeline>,
    wal_begin_seq: u64,
}

fn run_state_machine(shared: &Arc<MigratorShared>, job: MigrationJob) {
    let slot = job.slot;
    let mut session = MigrationSession {
        job,
        snapshot: None,
        pipeline: None,
        wal_begin_seq: 0,
    };

    let mut stage = MigrationStage::Start;
    loop {
        shared.set_stage(stage);
        stage = match stage {
            MigrationStage::Start => match start_migration(shared, &mut session) {
                Ok(()) => {
                    tracing::info!(slot, "started migrating slot");
                    MigrationStage::Snapshot
                }
                Err(err) => {
                    tracing::error!(slot, error = %err, "failed to start migrating slot");
                    MigrationStage::Failed
                }
            },
            MigrationStage::Snapshot => match send_snapshot(shared, &mut session) {
                Ok(()) => MigrationStage::Wal,
                Err(err) => {
                    tracing::error!(slot, error = %err, "failed to send snapshot of slot");
                    MigrationStage::Failed
                }
            },
            MigrationStage::Wal => match sync_wal(shared, &mut session) {
                Ok(()) => {
                    tracing::info!(slot, "synced from WAL for slot");
                    MigrationStage::Success
                }
                Err(err) => {
                    tracing::error!(slot, error = %err, "failed to sync from WAL for slot");
                    MigrationStage::Failed
                }
            },
            MigrationStage::Success => match finish_successful_migration(shared, &mut session) {
                Ok(()) => {
                    shared.set_state(MigrationState::Success);
                    tracing::info!(slot, "migrated slot");
                    MigrationStage::Clean
                }
                Err(err) => {
                    tracing::error!(slot, error = %err, "failed to finish successful migration");
                    MigrationStage::Failed
                }
            },
            MigrationStage::Failed => {
                if let Err(err) = finish_failed_migration(shared, &mut session) {
                    tracing::error!(slot, error = %err, "failed to finish failed migration");
                }
                shared.set_state(MigrationState::Failed);
                MigrationStage::Clean
            }
            MigrationStage::Clean => {
                clean(shared, session);
                return;
            }
            MigrationStage::None => unreachable!("state machine never enters None"),
        };
    }
}

fn start_migration(
    shared: &Arc<MigratorShared>,
    session: &mut MigrationSession,
) -> MigrateResult<()> {
    let ctx = &shared.ctx;

    // Snapshot first: Clean must be able to release it even when the
    // connect or handshake below fails.
    let snapshot = ctx.store.snapshot();
    session.wal_begin_seq = snapshot.sequence();
    session.snapshot = Some(snapshot);

    // Persist the session right after connect: a failure in the handshake
    // below still leaves a socket for the best-effort IMPORT_FAILED notice.
    let pipeline = CommandPipeline::connect(
        &session.job.dst_addr,
        session.job.max_speed,
        session.job.pipeline_size,
        shared.stop.clone(),
    )?;
    let pipeline = session.pipeline.insert(pipeline);

    if let Some(password) = &ctx.config.requirepass {
        pipeline.send_control(&[b"AUTH".to_vec(), password.clone().into_bytes()])?;
    }
    pipeline.send_control(&import_command(session.job.slot, IMPORT_START))?;

    Ok(())
}

fn send_snapshot(
    shared: &Arc<MigratorShared>,
    session: &mut MigrationSession,
) -> MigrateResult<()> {
    let slot = session.job.slot;
    let namespace = shared.ctx.db.namespace().to_vec();
    let prefix = slot_prefix(&namespace, slot);
    tracing::info!(slot, "start migrating snapshot of slot");

    let mut migrated = 0u64;
    let mut expired = 0u64;
    let mut empty = 0u64;

    let snapshot = session
        .snapshot
        .take()
        .ok_or_else(|| MigrateError::Internal("snapshot not pinned".to_string()))?;
    let mut pipeline = session
        .pipeline
        .take()
        .ok_or_else(|| MigrateError::Internal("pipeline not connected".to_string()))?;

    let result = (|| -> MigrateResult<()> {
        for (encoded_key, encoded_metadata) in snapshot.scan_prefix(Column::Metadata, &prefix) {
            if shared.stopped() {
                return Err(MigrateError::Cancelled);
            }
            let (_, user_key) =
                split_metadata_key(&encoded_key).map_err(MigrateError::db_read)?;

            match migrate_one_key(
                shared,
                &snapshot,
                &mut pipeline,
                &namespace,
                slot,
                &user_key,
                &encoded_metadata,
            )? {
                KeyMigrationResult::Migrated => {
                    tracing::debug!(key = %String::from_utf8_lossy(&user_key), "migrated key");
                    migrated += 1;
                }
                KeyMigrationResult::Expired => {
                    tracing::debug!(key = %String::from_utf8_lossy(&user_key), "key is expired");
                    expired += 1;
                }
                KeyMigrationResult::Empty => {
                    tracing::debug!(key = %String::from_utf8_lossy(&user_key), "key has no elements");
                    empty += 1;
                }
            }
        }
        // The final pipeline may sit below the width threshold; force it out.
        pipeline.flush(true)
    })();

    session.snapshot = Some(snapshot);
    session.pipeline = Some(pipeline);
    result?;

    tracing::info!(
        slot,
        migrated_keys = migrated,
        expired_keys = expired,
        empty_keys = empty,
        "migrated slot snapshot"
    );
    Ok(())
}

fn migrate_one_key(
    shared: &Arc<MigratorShared>,
    snapshot: &Snapshot,
    pipeline: &mut CommandPipeline,
    namespace: &[u8],
    slot: u16,
    user_key: &[u8],
    encoded_metadata: &[u8],
) -> MigrateResult<KeyMigrationResult> {
    // A metadata record this node cannot decode is unrecoverable.
    let metadata = Metadata::decode(encoded_metadata).map_err(MigrateError::db_read)?;

    if metadata.is_empty_collection() {
        return Ok(KeyMigrationResult::Empty);
    }
    if metadata.is_expired(now_ms()) {
        return Ok(KeyMigrationResult::Expired);
    }

    match metadata.kind {
        RecordKind::String => {
            let mut args = vec![
                b"SET".to_vec(),
                user_key.to_vec(),
                encoded_metadata[METADATA_HEADER_LEN..].to_vec(),
            ];
            if metadata.expire_ms > 0 {
                args.push(b"PXAT".to_vec());
                args.push(metadata.expire_ms.to_string().into_bytes());
            }
            pipeline.emit(&args)?;
        }
        RecordKind::Stream => {
            let trailer = StreamTrailer::decode(&encoded_metadata[METADATA_HEADER_LEN..])
                .map_err(MigrateError::db_read)?;
            migrate_stream_key(
                shared, snapshot, pipeline, namespace, slot, user_key, &metadata, &trailer,
            )?;
        }
        _ => {
            migrate_complex_key(shared, snapshot, pipeline, namespace, slot, user_key, &metadata)?;
        }
    }
    Ok(KeyMigrationResult::Migrated)
}

fn migrate_complex_key(
    shared: &Arc<MigratorShared>,
    snapshot: &Snapshot,
    pipeline: &mut CommandPipeline,
    namespace: &[u8],
    slot: u16,
    user_key: &[u8],
    metadata: &Metadata,
) -> MigrateResult<()> {
    let mut args = vec![metadata.kind.restore_verb().to_vec(), user_key.to_vec()];
    let prefix = subkey_prefix(namespace, slot, user_key, metadata.version);
    let mut item_count = 0usize;

    for (encoded_key, value) in snapshot.scan_prefix(Column::Subkey, &prefix) {
        if shared.stopped() {
            return Err(MigrateError::Cancelled);
        }
        let parsed = split_subkey(&encoded_key).map_err(MigrateError::db_read)?;

        match metadata.kind {
            RecordKind::Set => args.push(parsed.element),
            RecordKind::SortedInt => {
                let id = be_u64(&parsed.element)?;
                args.push(id.to_string().into_bytes());
            }
            RecordKind::SortedSet => {
                let score =
                    crate::encoding::decode_double(&value).map_err(MigrateError::db_read)?;
                args.push(format_double(score).into_bytes());
                args.push(parsed.element);
            }
            RecordKind::Hash => {
                args.push(parsed.element);
                args.push(value);
            }
            RecordKind::List => args.push(value),
            RecordKind::Bitmap => {
                // One SETBIT per set bit; never batched.
                migrate_bitmap_chunk(pipeline, user_key, &parsed.element, &value)?;
                continue;
            }
            RecordKind::String | RecordKind::Stream => {
                return Err(MigrateError::Internal(
                    "simple key reached complex-key migration".to_string(),
                ))
            }
        }

        item_count += 1;
        if item_count >= MAX_ITEMS_PER_COMMAND {
            pipeline.emit(&args)?;
            args.truncate(2);
            item_count = 0;
        }
    }

    if args.len() > 2 {
        pipeline.push(&args)?;
    }
    if metadata.expire_ms > 0 {
        pipeline.push(&[
            b"PEXPIREAT".to_vec(),
            user_key.to_vec(),
            metadata.expire_ms.to_string().into_bytes(),
        ])?;
    }
    pipeline.flush(false)
}

fn migrate_bitmap_chunk(
    pipeline: &mut CommandPipeline,
    user_key: &[u8],
    element: &[u8],
    chunk: &[u8],
) -> MigrateResult<()> {
    let chunk_index = decode_chunk_index(element).map_err(MigrateError::db_read)?;
    for (byte_index, byte) in chunk.iter().enumerate() {
        if *byte == 0 {
            continue;
        }
        for bit in 0..8u32 {
            if byte & (1 << bit) != 0 {
                let offset = bitmap_offset(chunk_index, byte_index, bit);
                pipeline.emit(&[
                    b"SETBIT".to_vec(),
                    user_key.to_vec(),
                    offset.to_string().into_bytes(),
                    b"1".to_vec(),
                ])?;
            }
        }
    }
    Ok(())
}

fn migrate_stream_key(
    shared: &Arc<MigratorShared>,
    snapshot: &Snapshot,
    pipeline: &mut CommandPipeline,
    namespace: &[u8],
    slot: u16,
    user_key: &[u8],
    metadata: &Metadata,
    trailer: &StreamTrailer,
) -> MigrateResult<()> {
    let prefix = subkey_prefix(namespace, slot, user_key, metadata.version);
    for (encoded_key, value) in snapshot.scan_prefix(Column::Stream, &prefix) {
        if shared.stopped() {
            return Err(MigrateError::Cancelled);
        }
        let parsed = split_subkey(&encoded_key).map_err(MigrateError::db_read)?;
        let args = stream_add_args(user_key, &parsed.element, &value)?;
        pipeline.emit(&args)?;
    }

    // Entry replay cannot restore ids of trimmed or deleted entries; XSETID
    // aligns the destination's stream bookkeeping with the source.
    pipeline.emit(&[
        b"XSETID".to_vec(),
        user_key.to_vec(),
        trailer.last_generated_id.to_string().into_bytes(),
        b"ENTRIESADDED".to_vec(),
        trailer.entries_added.to_string().into_bytes(),
        b"MAXDELETEDID".to_vec(),
        trailer.max_deleted_id.to_string().into_bytes(),
    ])?;

    if metadata.expire_ms > 0 {
        pipeline.emit(&[
            b"PEXPIREAT".to_vec(),
            user_key.to_vec(),
            metadata.expire_ms.to_string().into_bytes(),
        ])?;
    }
    Ok(())
}

fn sync_wal(shared: &Arc<MigratorShared>, session: &mut MigrationSession) -> MigrateResult<()> {
    // Phase A: chase the WAL until the remaining gap is small, bounded so a
    // write storm cannot hold the migration open forever.
    let mut epoch = 0u32;
    while epoch < MAX_WAL_EPOCHS {
        let latest = shared.ctx.store.latest_sequence();
        let gap = latest.saturating_sub(session.wal_begin_seq);
        if gap <= session.job.seq_gap_limit {
            tracing::info!(
                gap,
                limit = session.job.seq_gap_limit,
                "incremental gap below limit, forbidding slot"
            );
            break;
        }
        migrate_increment_data(shared, session, latest)?;
        session.wal_begin_seq = latest;
        epoch += 1;
    }
    tracing::info!(epochs = epoch, "synced incremental data before forbidding slot");

    set_forbidden_slot(shared, session.job.slot);

    // Phase B: writers to the slot are blocked now; one final tail drains
    // everything admitted before the cutover.
    let latest = shared.ctx.store.latest_sequence();
    if latest > session.wal_begin_seq {
        migrate_increment_data(shared, session, latest)?;
        session.wal_begin_seq = latest;
    }
    Ok(())
}

fn set_forbidden_slot(shared: &Arc<MigratorShared>, slot: u16) {
    tracing::info!(slot, "setting forbidden slot");
    let start = Instant::now();
    {
        let _exclusive = shared.ctx.work_exclusive();
        shared.ctx.gate.set_forbidden(slot);
    }
    let blocked = start.elapsed();
    tracing::info!(slot, blocked_us = blocked.as_micros() as u64, "forbidden slot set");
}

fn migrate_increment_data(
    shared: &Arc<MigratorShared>,
    session: &mut MigrationSession,
    end_seq: u64,
) -> MigrateResult<()> {
    let namespace = shared.ctx.db.namespace().to_vec();
    let decoder = BatchDecoder::new(&namespace, Some(session.job.slot), false);
    let pipeline = session
        .pipeline
        .as_mut()
        .ok_or_else(|| MigrateError::Internal("pipeline not connected".to_string()))?;

    let mut next_seq = session.wal_begin_seq + 1;
    let mut batches = shared.ctx.store.wal_batches(next_seq).into_iter();

    loop {
        if shared.stopped() {
            return Err(MigrateError::Cancelled);
        }

        let Some(batch) = batches.next() else {
            // The tail ended before the target; some sequence range is gone.
            return Err(MigrateError::DbRead(format!(
                "wal iterator ended before target sequence, expected {next_seq}, target {end_seq}"
            )));
        };
        if batch.first_seq != next_seq {
            return Err(MigrateError::Discontinuity {
                expected: next_seq,
                got: batch.first_seq,
            });
        }

        decoder.decode(&batch, pipeline)?;
        pipeline.flush(false)?;

        next_seq = batch.next_seq();
        if next_seq > end_seq {
            tracing::info!(
                from = session.wal_begin_seq,
                to = end_seq,
                "migrated one epoch of incremental data"
            );
            break;
        }
    }

    pipeline.flush(true)
}

fn finish_successful_migration(
    shared: &Arc<MigratorShared>,
    session: &mut MigrationSession,
) -> MigrateResult<()> {
    if shared.stopped() {
        return Err(MigrateError::Cancelled);
    }

    let pipeline = session
        .pipeline
        .as_mut()
        .ok_or_else(|| MigrateError::Internal("pipeline not connected".to_string()))?;
    pipeline.send_control(&import_command(session.job.slot, IMPORT_SUCCESS))?;

    // Until topology records the new owner, this node still answers for the
    // slot; afterwards reads redirect and forbidden stays for observability.
    shared
        .ctx
        .topology
        .set_slot_migrated(
            session.job.slot,
            SlotOwner {
                node_id: session.job.dst_node_id.clone(),
                addr: session.job.dst_addr.clone(),
            },
        )
        .map_err(|err| MigrateError::Internal(format!("mark slot migrated: {err}")))?;

    shared.ctx.gate.clear_failed();
    Ok(())
}

fn finish_failed_migration(
    shared: &Arc<MigratorShared>,
    session: &mut MigrationSession,
) -> MigrateResult<()> {
    // Writes to the slot are permitted again on this node.
    let gate = &shared.ctx.gate;
    gate.release_forbidden();
    gate.set_failed(session.job.slot);

    // Best effort: let the destination drop partial state.
    if let Some(pipeline) = session.pipeline.as_mut() {
        pipeline.send_control(&import_command(session.job.slot, IMPORT_FAILED))?;
    }
    Ok(())
}

fn clean(shared: &Arc<MigratorShared>, session: MigrationSession) {
    tracing::info!(slot = session.job.slot, "cleaning up migration resources");
    let MigrationSession {
        snapshot, pipeline, ..
    } = session;
    if let Some(pipeline) = &pipeline {
        if pipeline.pending() > 0 {
            tracing::warn!(
                pending = pipeline.pending(),
                "dropping unacknowledged pipeline commands"
            );
        }
    }
    // Exactly-once release of the pinned snapshot, then the socket.
    drop(snapshot);
    drop(pipeline);

    shared.set_stage(MigrationStage::None);
    shared.ctx.gate.end();
    shared.stop.store(false, Ordering::Release);
}

fn import_command(slot: u16, status: u8) -> Vec<Vec<u8>> {
    vec![
        b"CLUSTER".to_vec(),
        b"IMPORT".to_vec(),
        slot.to_string().into_bytes(),
        status.to_string().into_bytes(),
    ]
}

fn be_u64(data: &[u8]) -> MigrateResult<u64> {
    let mut offset = 0usize;
    crate::encoding::read_u64(data, &mut offset).map_err(MigrateError::db_read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn temp_migrator(name: &str) -> (SlotMigrator, Arc<NodeContext>, tempfile::TempDir) {
        let dir = tempfile::Builder::new()
            .prefix(name)
            .tempdir()
            .expect("create temp dir");
        let ctx = NodeContext::open(Config::default(), dir.path()).expect("open node");
        let migrator = SlotMigrator::spawn(ctx.clone()).expect("spawn migrator");
        (migrator, ctx, dir)
    }

    #[test]
    fn info_is_empty_before_any_migration() {
        let (migrator, _ctx, _dir) = temp_migrator("migrate_info_empty");
        assert_eq!(migrator.migration_info(), "");
        assert_eq!(migrator.state(), MigrationState::None);
        assert_eq!(migrator.current_stage(), MigrationStage::None);
    }

    #[test]
    fn second_submission_is_rejected_while_running() {
        let (migrator, ctx, _dir) = temp_migrator("migrate_busy");
        // Claim the register directly; no worker pickup involved.
        assert!(ctx.gate.try_begin(5));
        let err = migrator
            .perform_slot_migration("peer", "127.0.0.1:1", 6, 0, 0, 0)
            .expect_err("second job must be rejected");
        assert!(err.to_string().contains("already a migrating slot"));
        ctx.gate.end();
    }

    #[test]
    fn migrated_slot_cannot_be_resubmitted() {
        let (migrator, ctx, _dir) = temp_migrator("migrate_forbidden_resubmit");
        ctx.gate.set_forbidden(9);
        let err = migrator
            .perform_slot_migration("peer", "127.0.0.1:1", 9, 0, 0, 0)
            .expect_err("migrated slot must be rejected");
        assert!(err.to_string().contains("has been migrated"));
        // The claim taken by the rejected submission was rolled back.
        assert_eq!(ctx.gate.migrating_slot(), None);
    }

    #[test]
    fn job_parameters_fall_back_to_config_defaults() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let ctx = NodeContext::open(Config::default(), dir.path()).expect("open node");
        let config = &ctx.config;
        // Mirror of the clamping in perform_slot_migration.
        let speed = -3i64;
        let pipeline_size = 0i64;
        let seq_gap = -1i64;
        assert_eq!(if speed <= 0 { 0 } else { speed as u64 }, 0);
        assert_eq!(
            if pipeline_size <= 0 {
                config.migrate_pipeline_size
            } else {
                pipeline_size as usize
            },
            16
        );
        assert_eq!(
            if seq_gap <= 0 {
                config.migrate_sequence_gap
            } else {
                seq_gap as u64
            },
            10_000
        );
    }
}
