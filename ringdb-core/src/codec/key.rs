//! Tuple key encoding
//!
//! Each tuple element carries a 1-byte type tag followed by its payload:
//!
//! - `0x01` u64, 8-byte big-endian
//! - `0x02` UTF-8 string, zero-terminated, `0x00` stuffed as `0x00 0xFF`
//! - `0x03` raw bytes, same framing as strings
//!
//! Fixed-width big-endian integers and byte-stuffed terminators make the
//! byte order of encoded keys match the lexicographic order of the tuples,
//! which is what range scans over `(1, metric_id, *)` rely on.

use super::family;
use crate::{MetricId, Result, RingError};
use bytes::{Buf, BufMut, BytesMut};

const TAG_U64: u8 = 0x01;
const TAG_STRING: u8 = 0x02;
const TAG_BYTES: u8 = 0x03;

/// A decoded tuple element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    U64(u64),
    String(String),
    Bytes(Vec<u8>),
}

/// Incremental tuple key builder
#[derive(Debug, Default)]
pub struct KeyBuf {
    buf: BytesMut,
}

impl KeyBuf {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn push_u64(mut self, v: u64) -> Self {
        self.buf.put_u8(TAG_U64);
        self.buf.put_u64(v);
        self
    }

    pub fn push_str(mut self, s: &str) -> Self {
        self.buf.put_u8(TAG_STRING);
        put_stuffed(&mut self.buf, s.as_bytes());
        self
    }

    pub fn push_bytes(mut self, b: &[u8]) -> Self {
        self.buf.put_u8(TAG_BYTES);
        put_stuffed(&mut self.buf, b);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

fn put_stuffed(buf: &mut BytesMut, data: &[u8]) {
    for &b in data {
        buf.put_u8(b);
        if b == 0x00 {
            buf.put_u8(0xFF);
        }
    }
    buf.put_u8(0x00);
}

/// Decode a full key back into its elements
pub fn decode(key: &[u8]) -> Result<Vec<Element>> {
    let mut buf = key;
    let mut elements = Vec::new();
    while buf.has_remaining() {
        let tag = buf.get_u8();
        match tag {
            TAG_U64 => {
                if buf.remaining() < 8 {
                    return Err(corrupt("truncated u64 element"));
                }
                elements.push(Element::U64(buf.get_u64()));
            }
            TAG_STRING => {
                let raw = get_stuffed(&mut buf)?;
                let s = String::from_utf8(raw).map_err(|_| corrupt("non-UTF-8 string element"))?;
                elements.push(Element::String(s));
            }
            TAG_BYTES => {
                elements.push(Element::Bytes(get_stuffed(&mut buf)?));
            }
            other => return Err(corrupt(&format!("unknown element tag {:#04x}", other))),
        }
    }
    Ok(elements)
}

fn get_stuffed(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        if !buf.has_remaining() {
            return Err(corrupt("unterminated string element"));
        }
        let b = buf.get_u8();
        if b == 0x00 {
            // escaped NUL or terminator
            if buf.has_remaining() && buf[0] == 0xFF {
                buf.advance(1);
                out.push(0x00);
            } else {
                return Ok(out);
            }
        } else {
            out.push(b);
        }
    }
}

fn corrupt(msg: &str) -> RingError {
    RingError::BackendFatal(format!("key decode: {}", msg))
}

/// End of the range that starts at `prefix`: the prefix with its last
/// non-0xFF byte incremented. Keys produced by [`KeyBuf`] always end in a
/// terminator or integer payload, so the plain increment is sufficient.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // all-0xFF prefix scans to the end of the keyspace
    vec![0xFF; prefix.len() + 1]
}

// Key builders, one per family.

pub fn id_counter_key() -> Vec<u8> {
    KeyBuf::new().push_u64(family::ID_COUNTER).finish()
}

pub fn sample_key(metric_id: MetricId, slot: u32) -> Vec<u8> {
    KeyBuf::new()
        .push_u64(family::SAMPLE)
        .push_u64(metric_id)
        .push_u64(u64::from(slot))
        .finish()
}

/// Range covering every sample slot of a metric
pub fn sample_range(metric_id: MetricId) -> (Vec<u8>, Vec<u8>) {
    let prefix = KeyBuf::new()
        .push_u64(family::SAMPLE)
        .push_u64(metric_id)
        .finish();
    let end = prefix_end(&prefix);
    (prefix, end)
}

/// Range covering sample slots `[start_slot, end_slot]` of a metric
pub fn sample_slot_range(metric_id: MetricId, start_slot: u32, end_slot: u32) -> (Vec<u8>, Vec<u8>) {
    (
        sample_key(metric_id, start_slot),
        prefix_end(&sample_key(metric_id, end_slot)),
    )
}

/// Slot index of a decoded sample key
pub fn sample_key_slot(key: &[u8]) -> Result<u32> {
    match decode(key)?.as_slice() {
        [Element::U64(f), Element::U64(_), Element::U64(slot)] if *f == family::SAMPLE => {
            Ok(*slot as u32)
        }
        _ => Err(corrupt("not a sample key")),
    }
}

pub fn descriptor_key(metric_id: MetricId) -> Vec<u8> {
    KeyBuf::new()
        .push_u64(family::DESCRIPTOR)
        .push_u64(metric_id)
        .finish()
}

pub fn descriptor_range() -> (Vec<u8>, Vec<u8>) {
    let prefix = KeyBuf::new().push_u64(family::DESCRIPTOR).finish();
    let end = prefix_end(&prefix);
    (prefix, end)
}

pub fn descriptor_key_metric_id(key: &[u8]) -> Result<MetricId> {
    match decode(key)?.as_slice() {
        [Element::U64(f), Element::U64(id)] if *f == family::DESCRIPTOR => Ok(*id),
        _ => Err(corrupt("not a descriptor key")),
    }
}

pub fn counter_state_key(metric_id: MetricId) -> Vec<u8> {
    KeyBuf::new()
        .push_u64(family::COUNTER_STATE)
        .push_u64(metric_id)
        .finish()
}

pub fn name_index_key(name: &str, metric_id: MetricId) -> Vec<u8> {
    KeyBuf::new()
        .push_u64(family::NAME_INDEX)
        .push_str(name)
        .push_u64(metric_id)
        .finish()
}

/// Range covering every id registered under a name
pub fn name_index_range(name: &str) -> (Vec<u8>, Vec<u8>) {
    let prefix = KeyBuf::new()
        .push_u64(family::NAME_INDEX)
        .push_str(name)
        .finish();
    let end = prefix_end(&prefix);
    (prefix, end)
}

pub fn name_index_key_metric_id(key: &[u8]) -> Result<MetricId> {
    match decode(key)?.as_slice() {
        [Element::U64(f), Element::String(_), Element::U64(id)] if *f == family::NAME_INDEX => {
            Ok(*id)
        }
        _ => Err(corrupt("not a name index key")),
    }
}

pub fn tag_index_key(name: &str, tag_key: &str, tag_value: &str, metric_id: MetricId) -> Vec<u8> {
    KeyBuf::new()
        .push_u64(family::TAG_INDEX)
        .push_str(name)
        .push_str(tag_key)
        .push_str(tag_value)
        .push_u64(metric_id)
        .finish()
}

/// Range covering every id registered under a `(name, tag_key, tag_value)` triple
pub fn tag_index_range(name: &str, tag_key: &str, tag_value: &str) -> (Vec<u8>, Vec<u8>) {
    let prefix = KeyBuf::new()
        .push_u64(family::TAG_INDEX)
        .push_str(name)
        .push_str(tag_key)
        .push_str(tag_value)
        .finish();
    let end = prefix_end(&prefix);
    (prefix, end)
}

pub fn tag_index_key_metric_id(key: &[u8]) -> Result<MetricId> {
    match decode(key)?.as_slice() {
        [Element::U64(f), Element::String(_), Element::String(_), Element::String(_), Element::U64(id)]
            if *f == family::TAG_INDEX =>
        {
            Ok(*id)
        }
        _ => Err(corrupt("not a tag index key")),
    }
}

pub fn dashboard_key(slug: &str) -> Vec<u8> {
    KeyBuf::new()
        .push_u64(family::DASHBOARD)
        .push_str(slug)
        .finish()
}

pub fn dashboard_range() -> (Vec<u8>, Vec<u8>) {
    let prefix = KeyBuf::new().push_u64(family::DASHBOARD).finish();
    let end = prefix_end(&prefix);
    (prefix, end)
}

pub fn dashboard_key_slug(key: &[u8]) -> Result<String> {
    match decode(key)?.as_slice() {
        [Element::U64(f), Element::String(slug)] if *f == family::DASHBOARD => Ok(slug.clone()),
        _ => Err(corrupt("not a dashboard key")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = KeyBuf::new()
            .push_u64(5)
            .push_str("cpu\0load")
            .push_u64(42)
            .finish();
        let decoded = decode(&key).unwrap();
        assert_eq!(
            decoded,
            vec![
                Element::U64(5),
                Element::String("cpu\0load".to_string()),
                Element::U64(42)
            ]
        );
    }

    #[test]
    fn test_key_order_matches_tuple_order() {
        // slot order inside a metric
        assert!(sample_key(7, 0) < sample_key(7, 1));
        assert!(sample_key(7, 1) < sample_key(7, 250));
        // metric order across metrics
        assert!(sample_key(7, u32::MAX) < sample_key(8, 0));
        // string order
        let a = KeyBuf::new().push_u64(4).push_str("aa").finish();
        let b = KeyBuf::new().push_u64(4).push_str("ab").finish();
        let c = KeyBuf::new().push_u64(4).push_str("b").finish();
        assert!(a < b && b < c);
        // a string is a strict prefix of its extensions
        let short = KeyBuf::new().push_str("ab").finish();
        let long = KeyBuf::new().push_str("ab0").finish();
        assert!(short < long);
    }

    #[test]
    fn test_sample_range_covers_all_slots() {
        let (start, end) = sample_range(9);
        for slot in [0u32, 1, 1000, u32::MAX] {
            let key = sample_key(9, slot);
            assert!(key >= start && key < end, "slot {} outside range", slot);
        }
        let other = sample_key(10, 0);
        assert!(other >= end);
    }

    #[test]
    fn test_families_do_not_collide() {
        let sample = sample_key(1, 0);
        let (desc_start, desc_end) = descriptor_range();
        assert!(sample < desc_start || sample >= desc_end);
        let counter = counter_state_key(1);
        assert!(counter >= desc_end);
    }

    #[test]
    fn test_slot_extraction() {
        let key = sample_key(3, 1040);
        assert_eq!(sample_key_slot(&key).unwrap(), 1040);
        assert!(sample_key_slot(&descriptor_key(3)).is_err());
    }

    #[test]
    fn test_index_decoding() {
        let key = name_index_key("cpu_percent", 12);
        assert_eq!(name_index_key_metric_id(&key).unwrap(), 12);
        let key = tag_index_key("cpu_percent", "host", "db01", 12);
        assert_eq!(tag_index_key_metric_id(&key).unwrap(), 12);
        assert_eq!(
            dashboard_key_slug(&dashboard_key("fleet-overview")).unwrap(),
            "fleet-overview"
        );
    }

    #[test]
    fn test_name_range_excludes_other_names() {
        let (start, end) = name_index_range("cpu");
        assert!(name_index_key("cpu", 0) >= start);
        assert!(name_index_key("cpu", u64::MAX) < end);
        assert!(name_index_key("cpu2", 0) >= end);
        assert!(name_index_key("cp", 0) < start);
    }
}
