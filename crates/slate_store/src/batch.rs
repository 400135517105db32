//! Decode committed write batches into destination commands.
//!
//! A visitor over batch entries, dispatching on column, operation, and the
//! command hint the write path stamped onto the batch. The same decoder
//! feeds the WAL phase of a slot migration and the replication stream; the
//! `migrating_slot` filter and `is_replication` flag select between them.
//! Decoded commands leave through a [`CommandEmitter`] so the caller decides
//! whether they hit a socket or a buffer.

use crate::encoding::{
    decode_double, decode_stream_entry_value, read_u64, split_metadata_key, split_subkey,
    ListTrailer, Metadata, RecordKind, StreamEntryId, METADATA_HEADER_LEN,
};
use crate::error::{MigrateError, MigrateResult};
use crate::pipeline::CommandEmitter;
use crate::resp::format_double;
use crate::store::{BatchHint, Column, WalBatch, WalEntry, WriteOp, WriteOrigin};

pub struct BatchDecoder {
    namespace: Vec<u8>,
    /// Only emit commands for keys in this slot; `None` emits everything.
    migrating_slot: Option<u16>,
    /// Replication propagates lazy-expire deletions; migration does not.
    is_replication: bool,
}

impl BatchDecoder {
    pub fn new(namespace: &[u8], migrating_slot: Option<u16>, is_replication: bool) -> Self {
        Self {
            namespace: namespace.to_vec(),
            migrating_slot,
            is_replication,
        }
    }

    /// Decode one batch, emitting the equivalent client commands in entry
    /// order.
    pub fn decode<E: CommandEmitter>(&self, batch: &WalBatch, emit: &mut E) -> MigrateResult<()> {
        // A list write carries its metadata update in the same batch; the
        // new bounds tell a head deletion from a tail deletion.
        let list_bounds = self.list_bounds(batch);

        for entry in &batch.entries {
            if !self.in_namespace(&entry.key) {
                continue;
            }
            match entry.column {
                Column::Metadata => self.decode_metadata(batch.hint, entry, emit)?,
                Column::Subkey => self.decode_subkey(batch.hint, entry, list_bounds, emit)?,
                Column::Stream => self.decode_stream(entry, emit)?,
            }
        }
        Ok(())
    }

    fn in_namespace(&self, key: &[u8]) -> bool {
        !key.is_empty()
            && key[0] as usize == self.namespace.len()
            && key.len() > self.namespace.len()
            && &key[1..1 + self.namespace.len()] == self.namespace.as_slice()
    }

    fn slot_matches(&self, slot: u16) -> bool {
        self.migrating_slot.map_or(true, |wanted| wanted == slot)
    }

    fn list_bounds(&self, batch: &WalBatch) -> Option<ListTrailer> {
        if batch.hint != BatchHint::LPop {
            return None;
        }
        batch.entries.iter().find_map(|entry| {
            if entry.column != Column::Metadata || entry.op != WriteOp::Put {
                return None;
            }
            let meta = Metadata::decode(&entry.value).ok()?;
            if meta.kind != RecordKind::List {
                return None;
            }
            ListTrailer::decode(&entry.value[METADATA_HEADER_LEN..]).ok()
        })
    }

    fn decode_metadata<E: CommandEmitter>(
        &self,
        hint: BatchHint,
        entry: &WalEntry,
        emit: &mut E,
    ) -> MigrateResult<()> {
        let (slot, user_key) =
            split_metadata_key(&entry.key).map_err(MigrateError::db_read)?;
        if !self.slot_matches(slot) {
            return Ok(());
        }

        match entry.op {
            WriteOp::Delete => {
                if entry.origin == WriteOrigin::Expiration && !self.is_replication {
                    // The destination expires the key on its own clock.
                    return Ok(());
                }
                emit.emit(&[b"DEL".to_vec(), user_key])
            }
            WriteOp::Put => match hint {
                BatchHint::Set => {
                    let meta = Metadata::decode(&entry.value).map_err(MigrateError::db_read)?;
                    if meta.kind != RecordKind::String {
                        return Ok(());
                    }
                    let mut args = vec![
                        b"SET".to_vec(),
                        user_key,
                        entry.value[METADATA_HEADER_LEN..].to_vec(),
                    ];
                    if meta.expire_ms > 0 {
                        args.push(b"PXAT".to_vec());
                        args.push(meta.expire_ms.to_string().into_bytes());
                    }
                    emit.emit(&args)
                }
                BatchHint::Expire => {
                    let meta = Metadata::decode(&entry.value).map_err(MigrateError::db_read)?;
                    if meta.expire_ms > 0 {
                        emit.emit(&[
                            b"PEXPIREAT".to_vec(),
                            user_key,
                            meta.expire_ms.to_string().into_bytes(),
                        ])
                    } else {
                        emit.emit(&[b"PERSIST".to_vec(), user_key])
                    }
                }
                // Size and trailer bookkeeping; the element entry in the
                // same batch carries the user-visible write.
                _ => Ok(()),
            },
        }
    }

    fn decode_subkey<E: CommandEmitter>(
        &self,
        hint: BatchHint,
        entry: &WalEntry,
        list_bounds: Option<ListTrailer>,
        emit: &mut E,
    ) -> MigrateResult<()> {
        let parsed = split_subkey(&entry.key).map_err(MigrateError::db_read)?;
        if !self.slot_matches(parsed.slot) {
            return Ok(());
        }
        let key = parsed.user_key;
        let element = parsed.element;

        match (entry.op, hint) {
            (WriteOp::Put, BatchHint::RPush) => {
                emit.emit(&[b"RPUSH".to_vec(), key, entry.value.clone()])
            }
            (WriteOp::Put, BatchHint::HSet) => {
                emit.emit(&[b"HSET".to_vec(), key, element, entry.value.clone()])
            }
            (WriteOp::Put, BatchHint::SAdd) => emit.emit(&[b"SADD".to_vec(), key, element]),
            (WriteOp::Put, BatchHint::ZAdd) => {
                let score = decode_double(&entry.value).map_err(MigrateError::db_read)?;
                emit.emit(&[
                    b"ZADD".to_vec(),
                    key,
                    format_double(score).into_bytes(),
                    element,
                ])
            }
            (WriteOp::Put, BatchHint::SiAdd) => {
                let id = read_be_u64(&element)?;
                emit.emit(&[b"SIADD".to_vec(), key, id.to_string().into_bytes()])
            }
            (WriteOp::Put, BatchHint::SetBit { offset, value }) => emit.emit(&[
                b"SETBIT".to_vec(),
                key,
                offset.to_string().into_bytes(),
                if value { b"1".to_vec() } else { b"0".to_vec() },
            ]),
            (WriteOp::Delete, BatchHint::LPop) => {
                let index = read_be_u64(&element)?;
                let head_side = list_bounds.map_or(true, |bounds| index < bounds.head);
                if head_side {
                    emit.emit(&[b"LPOP".to_vec(), key])
                } else {
                    emit.emit(&[b"RPOP".to_vec(), key])
                }
            }
            (WriteOp::Delete, BatchHint::HDel) => emit.emit(&[b"HDEL".to_vec(), key, element]),
            (WriteOp::Delete, BatchHint::SRem) => emit.emit(&[b"SREM".to_vec(), key, element]),
            (WriteOp::Delete, BatchHint::ZRem) => emit.emit(&[b"ZREM".to_vec(), key, element]),
            (WriteOp::Delete, BatchHint::SiRem) => {
                let id = read_be_u64(&element)?;
                emit.emit(&[b"SIREM".to_vec(), key, id.to_string().into_bytes()])
            }
            _ => Ok(()),
        }
    }

    fn decode_stream<E: CommandEmitter>(
        &self,
        entry: &WalEntry,
        emit: &mut E,
    ) -> MigrateResult<()> {
        if entry.op != WriteOp::Put {
            return Ok(());
        }
        let parsed = split_subkey(&entry.key).map_err(MigrateError::db_read)?;
        if !self.slot_matches(parsed.slot) {
            return Ok(());
        }
        let args = stream_add_args(&parsed.user_key, &parsed.element, &entry.value)?;
        emit.emit(&args)
    }
}

/// Build the `XADD` that reinserts one stored stream entry. Shared between
/// the WAL decoder and the snapshot scan of a stream key.
pub fn stream_add_args(
    user_key: &[u8],
    element: &[u8],
    value: &[u8],
) -> MigrateResult<Vec<Vec<u8>>> {
    let id = StreamEntryId::decode(element).map_err(MigrateError::db_read)?;
    let fields = decode_stream_entry_value(value).map_err(MigrateError::db_read)?;
    let mut args = Vec::with_capacity(3 + fields.len() * 2);
    args.push(b"XADD".to_vec());
    args.push(user_key.to_vec());
    args.push(id.to_string().into_bytes());
    for (field, field_value) in fields {
        args.push(field);
        args.push(field_value);
    }
    Ok(args)
}

fn read_be_u64(element: &[u8]) -> MigrateResult<u64> {
    let mut offset = 0usize;
    read_u64(element, &mut offset).map_err(MigrateError::db_read)
}
