//! Typed write paths over the raw store.
//!
//! Every mutation goes through here so each committed batch carries the
//! command hint and the metadata/element records stay consistent: collection
//! elements are stamped with the record version, and a full-key overwrite
//! allocates a fresh version that makes old elements unreachable.

use std::sync::Arc;

use anyhow::{bail, ensure};

use crate::encoding::{
    self, encode_double, encode_stream_entry_value, metadata_key, now_ms, slot_for_key, subkey,
    ListTrailer, Metadata, RecordKind, StreamEntryId, StreamTrailer, BITMAP_CHUNK_SIZE,
    METADATA_HEADER_LEN,
};
use crate::store::{BatchHint, Column, Store, WriteBatch, WriteOrigin};

pub struct TypedDb {
    store: Arc<Store>,
    namespace: Vec<u8>,
}

impl TypedDb {
    pub fn new(store: Arc<Store>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.as_bytes().to_vec(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    fn meta_key(&self, key: &[u8]) -> Vec<u8> {
        metadata_key(&self.namespace, slot_for_key(key), key)
    }

    fn element_key(&self, key: &[u8], version: u64, element: &[u8]) -> Vec<u8> {
        subkey(&self.namespace, slot_for_key(key), key, version, element)
    }

    /// Live metadata (with its raw record bytes) for `key`, treating an
    /// expired record as absent.
    fn live_metadata(
        &self,
        key: &[u8],
        expect: RecordKind,
    ) -> anyhow::Result<Option<(Metadata, Vec<u8>)>> {
        let Some(bytes) = self.store.get(Column::Metadata, &self.meta_key(key)) else {
            return Ok(None);
        };
        let meta = Metadata::decode(&bytes)?;
        if meta.is_expired(now_ms()) {
            return Ok(None);
        }
        if meta.kind != expect {
            bail!(
                "WRONGTYPE operation against a key holding a different kind of value"
            );
        }
        Ok(Some((meta, bytes)))
    }

    pub fn set(&self, key: &[u8], value: &[u8], expire_ms: u64) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let meta = Metadata {
            kind: RecordKind::String,
            expire_ms,
            version: self.store.next_version(),
            size: 0,
        };
        let mut batch = WriteBatch::new(BatchHint::Set);
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(value),
        );
        self.store.apply(batch)
    }

    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(bytes) = self.store.get(Column::Metadata, &self.meta_key(key)) else {
            return Ok(None);
        };
        let meta = Metadata::decode(&bytes)?;
        if meta.is_expired(now_ms()) {
            return Ok(None);
        }
        ensure!(meta.kind == RecordKind::String, "not a string key");
        Ok(Some(bytes[METADATA_HEADER_LEN..].to_vec()))
    }

    pub fn del(&self, key: &[u8]) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let mut batch = WriteBatch::new(BatchHint::Del);
        batch.delete(Column::Metadata, self.meta_key(key));
        self.store.apply(batch)
    }

    /// Set the absolute expiry on an existing key.
    pub fn pexpireat(&self, key: &[u8], expire_ms: u64) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let Some(bytes) = self.store.get(Column::Metadata, &self.meta_key(key)) else {
            bail!("no such key");
        };
        let mut meta = Metadata::decode(&bytes)?;
        meta.expire_ms = expire_ms;
        let trailer = bytes[METADATA_HEADER_LEN..].to_vec();
        let mut batch = WriteBatch::new(BatchHint::Expire);
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&trailer),
        );
        self.store.apply(batch)
    }

    /// Delete `key` if its expiry has passed, marking the write so the
    /// migration feed can skip it.
    pub fn lazy_expire(&self, key: &[u8]) -> anyhow::Result<bool> {
        let _w = self.store.write_serial();
        let Some(bytes) = self.store.get(Column::Metadata, &self.meta_key(key)) else {
            return Ok(false);
        };
        let meta = Metadata::decode(&bytes)?;
        if !meta.is_expired(now_ms()) {
            return Ok(false);
        }
        let mut batch = WriteBatch::new(BatchHint::Del);
        batch.delete_with_origin(
            Column::Metadata,
            self.meta_key(key),
            WriteOrigin::Expiration,
        );
        self.store.apply(batch)?;
        Ok(true)
    }

    pub fn rpush(&self, key: &[u8], values: &[&[u8]]) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let existing = self.live_metadata(key, RecordKind::List)?;
        let (mut meta, mut trailer) = match existing {
            Some((meta, bytes)) => (meta, ListTrailer::decode(&bytes[METADATA_HEADER_LEN..])?),
            None => (
                Metadata {
                    kind: RecordKind::List,
                    expire_ms: 0,
                    version: self.store.next_version(),
                    size: 0,
                },
                ListTrailer { head: 0, tail: 0 },
            ),
        };

        let mut batch = WriteBatch::new(BatchHint::RPush);
        for value in values {
            let index = trailer.tail.to_be_bytes();
            batch.put(
                Column::Subkey,
                self.element_key(key, meta.version, &index),
                value.to_vec(),
            );
            trailer.tail += 1;
        }
        meta.size += values.len() as u64;
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&trailer.encode()),
        );
        self.store.apply(batch)
    }

    pub fn lpop(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let _w = self.store.write_serial();
        let Some((mut meta, bytes)) = self.live_metadata(key, RecordKind::List)? else {
            return Ok(None);
        };
        if meta.size == 0 {
            return Ok(None);
        }
        let mut trailer = ListTrailer::decode(&bytes[METADATA_HEADER_LEN..])?;
        let element = trailer.head.to_be_bytes();
        let element_key = self.element_key(key, meta.version, &element);
        let value = self.store.get(Column::Subkey, &element_key);
        trailer.head += 1;
        meta.size -= 1;

        let mut batch = WriteBatch::new(BatchHint::LPop);
        batch.delete(Column::Subkey, element_key);
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&trailer.encode()),
        );
        self.store.apply(batch)?;
        Ok(value)
    }

    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let mut meta = match self.live_metadata(key, RecordKind::Hash)? {
            Some((meta, _)) => meta,
            None => Metadata {
                kind: RecordKind::Hash,
                expire_ms: 0,
                version: self.store.next_version(),
                size: 0,
            },
        };
        let element_key = self.element_key(key, meta.version, field);
        if self.store.get(Column::Subkey, &element_key).is_none() {
            meta.size += 1;
        }
        let mut batch = WriteBatch::new(BatchHint::HSet);
        batch.put(Column::Subkey, element_key, value.to_vec());
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&[]),
        );
        self.store.apply(batch)
    }

    pub fn hdel(&self, key: &[u8], field: &[u8]) -> anyhow::Result<bool> {
        let _w = self.store.write_serial();
        let Some((mut meta, _)) = self.live_metadata(key, RecordKind::Hash)? else {
            return Ok(false);
        };
        let element_key = self.element_key(key, meta.version, field);
        if self.store.get(Column::Subkey, &element_key).is_none() {
            return Ok(false);
        }
        meta.size -= 1;
        let mut batch = WriteBatch::new(BatchHint::HDel);
        batch.delete(Column::Subkey, element_key);
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&[]),
        );
        self.store.apply(batch)?;
        Ok(true)
    }

    pub fn sadd(&self, key: &[u8], members: &[&[u8]]) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let mut meta = match self.live_metadata(key, RecordKind::Set)? {
            Some((meta, _)) => meta,
            None => Metadata {
                kind: RecordKind::Set,
                expire_ms: 0,
                version: self.store.next_version(),
                size: 0,
            },
        };
        let mut batch = WriteBatch::new(BatchHint::SAdd);
        for member in members {
            let element_key = self.element_key(key, meta.version, member);
            if self.store.get(Column::Subkey, &element_key).is_none() {
                meta.size += 1;
            }
            batch.put(Column::Subkey, element_key, Vec::new());
        }
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&[]),
        );
        self.store.apply(batch)
    }

    pub fn srem(&self, key: &[u8], member: &[u8]) -> anyhow::Result<bool> {
        let _w = self.store.write_serial();
        let Some((mut meta, _)) = self.live_metadata(key, RecordKind::Set)? else {
            return Ok(false);
        };
        let element_key = self.element_key(key, meta.version, member);
        if self.store.get(Column::Subkey, &element_key).is_none() {
            return Ok(false);
        }
        meta.size -= 1;
        let mut batch = WriteBatch::new(BatchHint::SRem);
        batch.delete(Column::Subkey, element_key);
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&[]),
        );
        self.store.apply(batch)?;
        Ok(true)
    }

    pub fn zadd(&self, key: &[u8], score: f64, member: &[u8]) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let mut meta = match self.live_metadata(key, RecordKind::SortedSet)? {
            Some((meta, _)) => meta,
            None => Metadata {
                kind: RecordKind::SortedSet,
                expire_ms: 0,
                version: self.store.next_version(),
                size: 0,
            },
        };
        let element_key = self.element_key(key, meta.version, member);
        if self.store.get(Column::Subkey, &element_key).is_none() {
            meta.size += 1;
        }
        let mut batch = WriteBatch::new(BatchHint::ZAdd);
        batch.put(Column::Subkey, element_key, encode_double(score).to_vec());
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&[]),
        );
        self.store.apply(batch)
    }

    pub fn zrem(&self, key: &[u8], member: &[u8]) -> anyhow::Result<bool> {
        let _w = self.store.write_serial();
        let Some((mut meta, _)) = self.live_metadata(key, RecordKind::SortedSet)? else {
            return Ok(false);
        };
        let element_key = self.element_key(key, meta.version, member);
        if self.store.get(Column::Subkey, &element_key).is_none() {
            return Ok(false);
        }
        meta.size -= 1;
        let mut batch = WriteBatch::new(BatchHint::ZRem);
        batch.delete(Column::Subkey, element_key);
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&[]),
        );
        self.store.apply(batch)?;
        Ok(true)
    }

    pub fn siadd(&self, key: &[u8], id: u64) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let mut meta = match self.live_metadata(key, RecordKind::SortedInt)? {
            Some((meta, _)) => meta,
            None => Metadata {
                kind: RecordKind::SortedInt,
                expire_ms: 0,
                version: self.store.next_version(),
                size: 0,
            },
        };
        let element_key = self.element_key(key, meta.version, &id.to_be_bytes());
        if self.store.get(Column::Subkey, &element_key).is_none() {
            meta.size += 1;
        }
        let mut batch = WriteBatch::new(BatchHint::SiAdd);
        batch.put(Column::Subkey, element_key, Vec::new());
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&[]),
        );
        self.store.apply(batch)
    }

    pub fn sirem(&self, key: &[u8], id: u64) -> anyhow::Result<bool> {
        let _w = self.store.write_serial();
        let Some((mut meta, _)) = self.live_metadata(key, RecordKind::SortedInt)? else {
            return Ok(false);
        };
        let element_key = self.element_key(key, meta.version, &id.to_be_bytes());
        if self.store.get(Column::Subkey, &element_key).is_none() {
            return Ok(false);
        }
        meta.size -= 1;
        let mut batch = WriteBatch::new(BatchHint::SiRem);
        batch.delete(Column::Subkey, element_key);
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&[]),
        );
        self.store.apply(batch)?;
        Ok(true)
    }

    pub fn setbit(&self, key: &[u8], offset: u64, value: bool) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let mut meta = match self.live_metadata(key, RecordKind::Bitmap)? {
            Some((meta, _)) => meta,
            None => Metadata {
                kind: RecordKind::Bitmap,
                expire_ms: 0,
                version: self.store.next_version(),
                size: 0,
            },
        };

        let chunk_index = (offset / 8 / BITMAP_CHUNK_SIZE as u64) as u32;
        let byte_in_chunk = (offset / 8 % BITMAP_CHUNK_SIZE as u64) as usize;
        let bit_in_byte = (offset % 8) as u32;

        let element_key = self.element_key(key, meta.version, &chunk_index.to_be_bytes());
        let mut chunk = match self.store.get(Column::Subkey, &element_key) {
            Some(chunk) => chunk,
            None => {
                meta.size += 1;
                Vec::new()
            }
        };
        if chunk.len() <= byte_in_chunk {
            chunk.resize(byte_in_chunk + 1, 0);
        }
        if value {
            chunk[byte_in_chunk] |= 1 << bit_in_byte;
        } else {
            chunk[byte_in_chunk] &= !(1 << bit_in_byte);
        }

        let mut batch = WriteBatch::new(BatchHint::SetBit { offset, value });
        batch.put(Column::Subkey, element_key, chunk);
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&[]),
        );
        self.store.apply(batch)
    }

    pub fn xadd(
        &self,
        key: &[u8],
        id: StreamEntryId,
        fields: &[(Vec<u8>, Vec<u8>)],
    ) -> anyhow::Result<u64> {
        let _w = self.store.write_serial();
        let existing = self.live_metadata(key, RecordKind::Stream)?;
        let (mut meta, mut trailer) = match existing {
            Some((meta, bytes)) => (meta, StreamTrailer::decode(&bytes[METADATA_HEADER_LEN..])?),
            None => (
                Metadata {
                    kind: RecordKind::Stream,
                    expire_ms: 0,
                    version: self.store.next_version(),
                    size: 0,
                },
                StreamTrailer::default(),
            ),
        };
        ensure!(
            id > trailer.last_generated_id,
            "stream entry id is not strictly increasing"
        );
        trailer.last_generated_id = id;
        trailer.entries_added += 1;
        meta.size += 1;

        let mut batch = WriteBatch::new(BatchHint::XAdd);
        batch.put(
            Column::Stream,
            self.element_key(key, meta.version, &id.encode()),
            encode_stream_entry_value(fields),
        );
        batch.put(
            Column::Metadata,
            self.meta_key(key),
            meta.encode_with_trailer(&trailer.encode()),
        );
        self.store.apply(batch)
    }

    /// Raw metadata bytes for a key, if present (expired records included).
    pub fn raw_metadata(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.get(Column::Metadata, &self.meta_key(key))
    }
}

/// Absolute bit offset of `(chunk, byte, bit)` in a bitmap.
pub fn bitmap_offset(chunk_index: u32, byte_in_chunk: usize, bit_in_byte: u32) -> u64 {
    chunk_index as u64 * 8 * BITMAP_CHUNK_SIZE as u64 + byte_in_chunk as u64 * 8 + bit_in_byte as u64
}

/// Parse a bitmap chunk index element.
pub fn decode_chunk_index(element: &[u8]) -> anyhow::Result<u32> {
    let mut offset = 0usize;
    encoding::read_u32(element, &mut offset)
}
