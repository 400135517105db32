//! Key and value codecs for the slot-sharded keyspace.
//!
//! Three columns share one key grammar:
//! - metadata: `[ns_len u8][ns][slot u16][user_key]`
//! - subkey / stream: `[ns_len u8][ns][slot u16][key_len u32][user_key][version u64][element]`
//!
//! All integers are big-endian so lexicographic order matches numeric order
//! and one prefix seek covers a whole slot or a whole key version.

use anyhow::ensure;

/// Cluster-wide number of hash slots.
pub const SLOT_COUNT: u16 = 16384;

/// Namespace every client key lives in unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Bitmap values are stored as one subkey per chunk of this many bytes.
pub const BITMAP_CHUNK_SIZE: usize = 1024;

/// Fixed metadata header: kind, expire, version, size.
pub const METADATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;

/// Value kind of a metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    String,
    List,
    Hash,
    Set,
    SortedSet,
    Bitmap,
    SortedInt,
    Stream,
}

impl RecordKind {
    pub fn as_u8(self) -> u8 {
        match self {
            RecordKind::String => 0,
            RecordKind::List => 1,
            RecordKind::Hash => 2,
            RecordKind::Set => 3,
            RecordKind::SortedSet => 4,
            RecordKind::Bitmap => 5,
            RecordKind::SortedInt => 6,
            RecordKind::Stream => 7,
        }
    }

    pub fn from_u8(tag: u8) -> anyhow::Result<Self> {
        Ok(match tag {
            0 => RecordKind::String,
            1 => RecordKind::List,
            2 => RecordKind::Hash,
            3 => RecordKind::Set,
            4 => RecordKind::SortedSet,
            5 => RecordKind::Bitmap,
            6 => RecordKind::SortedInt,
            7 => RecordKind::Stream,
            other => anyhow::bail!("unknown record kind tag {other}"),
        })
    }

    /// Destination verb that rebuilds a key of this kind element by element.
    pub fn restore_verb(self) -> &'static [u8] {
        match self {
            RecordKind::String => b"SET",
            RecordKind::List => b"RPUSH",
            RecordKind::Hash => b"HMSET",
            RecordKind::Set => b"SADD",
            RecordKind::SortedSet => b"ZADD",
            RecordKind::Bitmap => b"SETBIT",
            RecordKind::SortedInt => b"SIADD",
            RecordKind::Stream => b"XADD",
        }
    }
}

/// Decoded metadata header. The kind-specific trailer stays with the caller
/// as the byte slice after [`METADATA_HEADER_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: RecordKind,
    /// Absolute expiry in milliseconds since epoch; zero means none.
    pub expire_ms: u64,
    /// Version stamped into every element subkey of this record.
    pub version: u64,
    /// Element count; unused for String and Stream.
    pub size: u64,
}

impl Metadata {
    pub fn encode_with_trailer(&self, trailer: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_HEADER_LEN + trailer.len());
        out.push(self.kind.as_u8());
        out.extend_from_slice(&self.expire_ms.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
        out.extend_from_slice(trailer);
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let kind = RecordKind::from_u8(read_u8(data, &mut offset)?)?;
        let expire_ms = read_u64(data, &mut offset)?;
        let version = read_u64(data, &mut offset)?;
        let size = read_u64(data, &mut offset)?;
        Ok(Self {
            kind,
            expire_ms,
            version,
            size,
        })
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expire_ms > 0 && self.expire_ms <= now_ms
    }

    /// A collection with no elements left; String and Stream never qualify.
    pub fn is_empty_collection(&self) -> bool {
        !matches!(self.kind, RecordKind::String | RecordKind::Stream) && self.size == 0
    }
}

/// List trailer: current head and tail element indexes (end-exclusive tail).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListTrailer {
    pub head: u64,
    pub tail: u64,
}

impl ListTrailer {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.head.to_be_bytes());
        out[8..].copy_from_slice(&self.tail.to_be_bytes());
        out
    }

    pub fn decode(trailer: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let head = read_u64(trailer, &mut offset)?;
        let tail = read_u64(trailer, &mut offset)?;
        Ok(Self { head, tail })
    }
}

/// Stream entry identifier in the usual `<ms>-<seq>` shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamEntryId {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.ms.to_be_bytes());
        out[8..].copy_from_slice(&self.seq.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let ms = read_u64(data, &mut offset)?;
        let seq = read_u64(data, &mut offset)?;
        Ok(Self { ms, seq })
    }
}

impl std::fmt::Display for StreamEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Stream trailer: last generated id, entries added, max deleted id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamTrailer {
    pub last_generated_id: StreamEntryId,
    pub entries_added: u64,
    pub max_deleted_id: StreamEntryId,
}

impl StreamTrailer {
    pub fn encode(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..16].copy_from_slice(&self.last_generated_id.encode());
        out[16..24].copy_from_slice(&self.entries_added.to_be_bytes());
        out[24..].copy_from_slice(&self.max_deleted_id.encode());
        out
    }

    pub fn decode(trailer: &[u8]) -> anyhow::Result<Self> {
        ensure!(trailer.len() >= 40, "short stream trailer");
        Ok(Self {
            last_generated_id: StreamEntryId::decode(&trailer[..16])?,
            entries_added: u64::from_be_bytes(trailer[16..24].try_into()?),
            max_deleted_id: StreamEntryId::decode(&trailer[24..40])?,
        })
    }
}

/// Hash a user key to its slot. A nonempty `{tag}` restricts hashing to the
/// tag so related keys can share a slot.
pub fn slot_for_key(key: &[u8]) -> u16 {
    let hashed = match key.iter().position(|&b| b == b'{') {
        Some(open) => match key[open + 1..].iter().position(|&b| b == b'}') {
            Some(close) if close > 0 => &key[open + 1..open + 1 + close],
            _ => key,
        },
        None => key,
    };
    crc16(hashed) % SLOT_COUNT
}

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Prefix shared by every metadata record of one slot.
pub fn slot_prefix(namespace: &[u8], slot: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + namespace.len() + 2);
    out.push(namespace.len() as u8);
    out.extend_from_slice(namespace);
    out.extend_from_slice(&slot.to_be_bytes());
    out
}

/// Metadata column key for one user key.
pub fn metadata_key(namespace: &[u8], slot: u16, key: &[u8]) -> Vec<u8> {
    let mut out = slot_prefix(namespace, slot);
    out.extend_from_slice(key);
    out
}

/// Split an encoded metadata key into `(slot, user_key)`.
pub fn split_metadata_key(encoded: &[u8]) -> anyhow::Result<(u16, Vec<u8>)> {
    let mut offset = 0usize;
    let ns_len = read_u8(encoded, &mut offset)? as usize;
    ensure!(offset + ns_len + 2 <= encoded.len(), "short metadata key");
    offset += ns_len;
    let slot = read_u16(encoded, &mut offset)?;
    Ok((slot, encoded[offset..].to_vec()))
}

/// Prefix shared by every element of one `(key, version)` pair.
pub fn subkey_prefix(namespace: &[u8], slot: u16, key: &[u8], version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + namespace.len() + 2 + 4 + key.len() + 8);
    out.push(namespace.len() as u8);
    out.extend_from_slice(namespace);
    out.extend_from_slice(&slot.to_be_bytes());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&version.to_be_bytes());
    out
}

/// Full subkey/stream column key for one element.
pub fn subkey(namespace: &[u8], slot: u16, key: &[u8], version: u64, element: &[u8]) -> Vec<u8> {
    let mut out = subkey_prefix(namespace, slot, key, version);
    out.extend_from_slice(element);
    out
}

/// Decoded parts of a subkey/stream column key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSubkey {
    pub slot: u16,
    pub user_key: Vec<u8>,
    pub version: u64,
    pub element: Vec<u8>,
}

pub fn split_subkey(encoded: &[u8]) -> anyhow::Result<ParsedSubkey> {
    let mut offset = 0usize;
    let ns_len = read_u8(encoded, &mut offset)? as usize;
    ensure!(offset + ns_len <= encoded.len(), "short subkey namespace");
    offset += ns_len;
    let slot = read_u16(encoded, &mut offset)?;
    let key_len = read_u32(encoded, &mut offset)? as usize;
    ensure!(offset + key_len <= encoded.len(), "short subkey user key");
    let user_key = encoded[offset..offset + key_len].to_vec();
    offset += key_len;
    let version = read_u64(encoded, &mut offset)?;
    Ok(ParsedSubkey {
        slot,
        user_key,
        version,
        element: encoded[offset..].to_vec(),
    })
}

/// Encode the field/value pairs of one stream entry.
pub fn encode_stream_entry_value(fields: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut size = 4;
    for (field, value) in fields {
        size += 4 + field.len() + 4 + value.len();
    }
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(fields.len() as u32).to_be_bytes());
    for (field, value) in fields {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

/// Decode the field/value pairs of one stream entry.
pub fn decode_stream_entry_value(data: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut offset = 0usize;
    let count = read_u32(data, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let field_len = read_u32(data, &mut offset)? as usize;
        ensure!(offset + field_len <= data.len(), "short stream field");
        let field = data[offset..offset + field_len].to_vec();
        offset += field_len;
        let value_len = read_u32(data, &mut offset)? as usize;
        ensure!(offset + value_len <= data.len(), "short stream value");
        let value = data[offset..offset + value_len].to_vec();
        offset += value_len;
        out.push((field, value));
    }
    Ok(out)
}

/// Encode a double so the byte order matches the numeric order.
pub fn encode_double(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let bits = if value.is_sign_negative() {
        !bits
    } else {
        bits ^ (1 << 63)
    };
    bits.to_be_bytes()
}

pub fn decode_double(data: &[u8]) -> anyhow::Result<f64> {
    ensure!(data.len() >= 8, "short double");
    let bits = u64::from_be_bytes(data[..8].try_into()?);
    let bits = if bits & (1 << 63) != 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    };
    Ok(f64::from_bits(bits))
}

/// Wall clock in milliseconds since epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    ensure!(*offset + 1 <= data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

pub(crate) fn read_u16(data: &[u8], offset: &mut usize) -> anyhow::Result<u16> {
    ensure!(*offset + 2 <= data.len(), "short u16");
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&data[*offset..*offset + 2]);
    *offset += 2;
    Ok(u16::from_be_bytes(buf))
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_roundtrip_with_trailer() {
        let meta = Metadata {
            kind: RecordKind::Hash,
            expire_ms: 9_999_999_999,
            version: 42,
            size: 3,
        };
        let encoded = meta.encode_with_trailer(b"tail");
        let decoded = Metadata::decode(&encoded).expect("decode metadata");
        assert_eq!(decoded, meta);
        assert_eq!(&encoded[METADATA_HEADER_LEN..], b"tail");
    }

    #[test]
    fn expiry_and_empty_classification() {
        let mut meta = Metadata {
            kind: RecordKind::Set,
            expire_ms: 0,
            version: 1,
            size: 0,
        };
        assert!(!meta.is_expired(1_000));
        assert!(meta.is_empty_collection());

        meta.expire_ms = 500;
        assert!(meta.is_expired(1_000));

        meta.kind = RecordKind::String;
        assert!(!meta.is_empty_collection());
    }

    #[test]
    fn slot_hash_is_stable_and_respects_hashtags() {
        assert_eq!(slot_for_key(b"foo"), slot_for_key(b"foo"));
        assert!(slot_for_key(b"foo") < SLOT_COUNT);
        assert_eq!(slot_for_key(b"{user1}.a"), slot_for_key(b"{user1}.b"));
        // Empty tags fall back to the whole key.
        assert_eq!(slot_for_key(b"{}x"), slot_for_key(b"{}x"));
    }

    #[test]
    fn subkey_roundtrip() {
        let encoded = subkey(b"default", 77, b"mykey", 9, b"field");
        let parsed = split_subkey(&encoded).expect("split subkey");
        assert_eq!(parsed.slot, 77);
        assert_eq!(parsed.user_key, b"mykey");
        assert_eq!(parsed.version, 9);
        assert_eq!(parsed.element, b"field");
        assert!(encoded.starts_with(&subkey_prefix(b"default", 77, b"mykey", 9)));
    }

    #[test]
    fn metadata_key_roundtrip() {
        let encoded = metadata_key(b"default", 3, b"k1");
        let (slot, user_key) = split_metadata_key(&encoded).expect("split");
        assert_eq!(slot, 3);
        assert_eq!(user_key, b"k1");
        assert!(encoded.starts_with(&slot_prefix(b"default", 3)));
    }

    #[test]
    fn double_encoding_preserves_order() {
        let values = [-1e300, -2.5, -0.0, 0.0, 1e-9, 1.0, 2.5, 1e300];
        let encoded: Vec<[u8; 8]> = values.iter().map(|v| encode_double(*v)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(sorted, encoded, "byte order must match numeric order");
        for value in values {
            let back = decode_double(&encode_double(value)).expect("decode double");
            assert_eq!(back.to_bits(), value.to_bits());
        }
    }

    #[test]
    fn stream_trailer_roundtrip() {
        let trailer = StreamTrailer {
            last_generated_id: StreamEntryId { ms: 17, seq: 3 },
            entries_added: 9,
            max_deleted_id: StreamEntryId { ms: 11, seq: 0 },
        };
        let decoded = StreamTrailer::decode(&trailer.encode()).expect("decode trailer");
        assert_eq!(decoded, trailer);
        assert_eq!(trailer.last_generated_id.to_string(), "17-3");
    }
}
