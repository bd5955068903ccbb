//! Value record encoding
//!
//! Samples and counter state are fixed-width: an i64 big-endian timestamp
//! followed by an IEEE-754 f64 little-endian value, 16 bytes total.
//! Descriptors are a versioned, stable-field-order map with length-prefixed
//! strings, so byte-identical descriptors mean identical metadata.

use crate::{CounterState, MetricDescriptor, MetricId, MetricType, Result, RingError, Sample};
use bytes::{Buf, BufMut, BytesMut};

/// Size of an encoded sample or counter-state record
pub const SAMPLE_RECORD_SIZE: usize = 16;

const DESCRIPTOR_VERSION: u8 = 1;
const FLAG_DELETING: u8 = 0x01;

pub fn encode_sample(sample: &Sample) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(SAMPLE_RECORD_SIZE);
    buf.put_i64(sample.ts);
    buf.put_f64_le(sample.value);
    buf.to_vec()
}

pub fn decode_sample(raw: &[u8]) -> Result<Sample> {
    let mut buf = raw;
    if buf.remaining() < SAMPLE_RECORD_SIZE {
        return Err(corrupt("sample record too short"));
    }
    Ok(Sample {
        ts: buf.get_i64(),
        value: buf.get_f64_le(),
    })
}

pub fn encode_counter_state(state: &CounterState) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(SAMPLE_RECORD_SIZE);
    buf.put_i64(state.last_ts);
    buf.put_f64_le(state.last_raw);
    buf.to_vec()
}

pub fn decode_counter_state(raw: &[u8]) -> Result<CounterState> {
    let mut buf = raw;
    if buf.remaining() < SAMPLE_RECORD_SIZE {
        return Err(corrupt("counter state record too short"));
    }
    Ok(CounterState {
        last_ts: buf.get_i64(),
        last_raw: buf.get_f64_le(),
    })
}

/// Descriptor layout:
/// version u8, flags u8, type u8, step u32, slots u32, created_at i64,
/// name (u16 length + bytes), tag count u16, then sorted (key, value) pairs
/// with the same string framing.
pub fn encode_descriptor(desc: &MetricDescriptor) -> Result<Vec<u8>> {
    let mut buf = BytesMut::new();
    buf.put_u8(DESCRIPTOR_VERSION);
    buf.put_u8(if desc.deleting { FLAG_DELETING } else { 0 });
    buf.put_u8(desc.metric_type.as_u8());
    buf.put_u32(desc.step);
    buf.put_u32(desc.slots);
    buf.put_i64(desc.created_at);
    put_str(&mut buf, &desc.name)?;
    if desc.tags.len() > usize::from(u16::MAX) {
        return Err(RingError::Validation("too many tags".into()));
    }
    buf.put_u16(desc.tags.len() as u16);
    for (k, v) in &desc.tags {
        put_str(&mut buf, k)?;
        put_str(&mut buf, v)?;
    }
    Ok(buf.to_vec())
}

pub fn decode_descriptor(metric_id: MetricId, raw: &[u8]) -> Result<MetricDescriptor> {
    let mut buf = raw;
    if buf.remaining() < 21 {
        return Err(corrupt("descriptor record too short"));
    }
    let version = buf.get_u8();
    if version != DESCRIPTOR_VERSION {
        return Err(corrupt(&format!("unknown descriptor version {}", version)));
    }
    let flags = buf.get_u8();
    let metric_type = MetricType::from_u8(buf.get_u8())?;
    let step = buf.get_u32();
    let slots = buf.get_u32();
    let created_at = buf.get_i64();
    let name = get_str(&mut buf)?;
    if buf.remaining() < 2 {
        return Err(corrupt("descriptor truncated at tags"));
    }
    let tag_count = buf.get_u16();
    let mut tags = std::collections::BTreeMap::new();
    for _ in 0..tag_count {
        let k = get_str(&mut buf)?;
        let v = get_str(&mut buf)?;
        tags.insert(k, v);
    }
    Ok(MetricDescriptor {
        metric_id,
        name,
        tags,
        step,
        slots,
        metric_type,
        created_at,
        deleting: flags & FLAG_DELETING != 0,
    })
}

pub fn encode_id_counter(next: MetricId) -> Vec<u8> {
    next.to_be_bytes().to_vec()
}

pub fn decode_id_counter(raw: &[u8]) -> Result<MetricId> {
    if raw.len() < 8 {
        return Err(corrupt("id counter record too short"));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[..8]);
    Ok(MetricId::from_be_bytes(bytes))
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > usize::from(u16::MAX) {
        return Err(RingError::Validation(format!(
            "string field too long: {} bytes",
            s.len()
        )));
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(corrupt("truncated string field"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(corrupt("truncated string payload"));
    }
    let s = String::from_utf8(buf[..len].to_vec()).map_err(|_| corrupt("non-UTF-8 string field"))?;
    buf.advance(len);
    Ok(s)
}

fn corrupt(msg: &str) -> RingError {
    RingError::BackendFatal(format!("record decode: {}", msg))
}
