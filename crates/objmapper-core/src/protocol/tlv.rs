//! Metadata TLVs attached to responses.
//!
//! Each entry is `type:u8, length:u16, value`. Unknown types are ignored
//! by readers so either side can add entries without breaking the peer.

use crate::error::{MapperError, Result};
use crate::payload::PayloadDescriptor;

/// Assigned metadata types.
pub const META_SIZE: u8 = 0x01; // 8 bytes, big-endian
pub const META_MTIME: u8 = 0x02; // 8 bytes, big-endian
pub const META_ETAG: u8 = 0x03; // variable string
pub const META_MIME: u8 = 0x04; // variable string
pub const META_BACKEND: u8 = 0x05; // 1 byte
pub const META_LATENCY: u8 = 0x06; // 4 bytes, microseconds
pub const META_PAYLOAD: u8 = 0x07; // fixed payload descriptor blob
pub const META_SEGMENT_HINTS: u8 = 0x08; // segment prefetch hints
/// Free-form error message on non-OK responses.
pub const META_ERROR: u8 = 0xFF;

/// One parsed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub entry_type: u8,
    pub value: Vec<u8>,
}

/// Builder for a metadata blob.
#[derive(Debug, Default)]
pub struct MetadataBuf {
    bytes: Vec<u8>,
}

impl MetadataBuf {
    pub fn new() -> MetadataBuf {
        MetadataBuf::default()
    }

    pub fn add(&mut self, entry_type: u8, value: &[u8]) -> &mut Self {
        debug_assert!(value.len() <= u16::MAX as usize);
        self.bytes.push(entry_type);
        self.bytes
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.bytes.extend_from_slice(value);
        self
    }

    pub fn add_size(&mut self, size: u64) -> &mut Self {
        self.add(META_SIZE, &size.to_be_bytes())
    }

    pub fn add_mtime(&mut self, mtime: u64) -> &mut Self {
        self.add(META_MTIME, &mtime.to_be_bytes())
    }

    pub fn add_backend(&mut self, backend_id: u8) -> &mut Self {
        self.add(META_BACKEND, &[backend_id])
    }

    pub fn add_latency_us(&mut self, latency_us: u32) -> &mut Self {
        self.add(META_LATENCY, &latency_us.to_be_bytes())
    }

    pub fn add_payload(&mut self, payload: &PayloadDescriptor) -> &mut Self {
        if let Ok(blob) = payload.encode() {
            self.add(META_PAYLOAD, &blob);
        }
        self
    }

    pub fn add_error(&mut self, message: &str) -> &mut Self {
        let bytes = message.as_bytes();
        let len = bytes.len().min(u16::MAX as usize);
        self.add(META_ERROR, &bytes[..len])
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Parse a metadata blob into entries. Trailing garbage that does not
/// frame as a TLV is a protocol error; unknown entry types are kept and
/// left to the caller to ignore.
pub fn parse(metadata: &[u8]) -> Result<Vec<MetadataEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset < metadata.len() {
        if offset + 3 > metadata.len() {
            return Err(MapperError::Protocol("truncated metadata TLV header".into()));
        }
        let entry_type = metadata[offset];
        let length = u16::from_be_bytes([metadata[offset + 1], metadata[offset + 2]]) as usize;
        offset += 3;

        if offset + length > metadata.len() {
            return Err(MapperError::Protocol("truncated metadata TLV value".into()));
        }
        entries.push(MetadataEntry {
            entry_type,
            value: metadata[offset..offset + length].to_vec(),
        });
        offset += length;
    }

    Ok(entries)
}

/// First entry of `entry_type`, if present.
pub fn get(entries: &[MetadataEntry], entry_type: u8) -> Option<&[u8]> {
    entries
        .iter()
        .find(|entry| entry.entry_type == entry_type)
        .map(|entry| entry.value.as_slice())
}

/// Decode the size TLV.
pub fn get_size(entries: &[MetadataEntry]) -> Option<u64> {
    get(entries, META_SIZE)
        .and_then(|value| value.try_into().ok())
        .map(u64::from_be_bytes)
}

/// Decode the payload descriptor TLV.
pub fn get_payload(entries: &[MetadataEntry]) -> Option<PayloadDescriptor> {
    get(entries, META_PAYLOAD).and_then(|value| PayloadDescriptor::decode(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_parse() {
        let mut buf = MetadataBuf::new();
        buf.add_size(17).add_mtime(1_700_000_000).add_backend(2);
        let bytes = buf.into_bytes();

        let entries = parse(&bytes).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(get_size(&entries), Some(17));
        assert_eq!(get(&entries, META_BACKEND), Some(&[2u8][..]));
        assert_eq!(get(&entries, META_MIME), None);
    }

    #[test]
    fn test_unknown_types_survive_parse() {
        let mut buf = MetadataBuf::new();
        buf.add(0x7E, b"future");
        let entries = parse(&buf.into_bytes()).unwrap();
        assert_eq!(entries[0].entry_type, 0x7E);
        assert_eq!(entries[0].value, b"future");
    }

    #[test]
    fn test_payload_round_trip_through_tlv() {
        let payload = PayloadDescriptor::identity(4096);
        let mut buf = MetadataBuf::new();
        buf.add_payload(&payload);
        let entries = parse(&buf.into_bytes()).unwrap();
        assert_eq!(get_payload(&entries), Some(payload));
    }

    #[test]
    fn test_truncated_value_rejected() {
        let mut bytes = Vec::new();
        bytes.push(META_ETAG);
        bytes.extend_from_slice(&100u16.to_be_bytes());
        bytes.extend_from_slice(b"short");
        assert!(parse(&bytes).is_err());
    }
}
