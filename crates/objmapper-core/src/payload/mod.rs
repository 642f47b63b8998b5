//! Payload descriptor schema.
//!
//! Each object may carry a versioned descriptor of up to [`MAX_VARIANTS`]
//! delivery variants (identity body, gzip body, flattened-ESI body, ...).
//! The descriptor is validated on write and travels as a fixed-size
//! little-endian blob both on disk and in the metadata TLV.

pub const PAYLOAD_DESCRIPTOR_VERSION: u32 = 1;
pub const MAX_VARIANTS: usize = 8;
pub const VARIANT_ID_MAX: usize = 32;

/// Encoded size of one variant slot: id + caps + encoding + three lengths
/// + primary byte + 7 reserved bytes.
pub const VARIANT_WIRE_SIZE: usize = VARIANT_ID_MAX + 4 + 4 + 8 + 8 + 8 + 1 + 7;

/// Encoded size of a whole descriptor: 4 header words + all variant slots.
pub const DESCRIPTOR_WIRE_SIZE: usize = 16 + MAX_VARIANTS * VARIANT_WIRE_SIZE;

/// Content encodings a variant may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ContentEncoding {
    Identity = 0,
    Gzip = 1,
    Brotli = 2,
    Zstd = 3,
    Custom = 255,
}

impl ContentEncoding {
    pub fn from_u32(value: u32) -> Option<ContentEncoding> {
        Some(match value {
            0 => ContentEncoding::Identity,
            1 => ContentEncoding::Gzip,
            2 => ContentEncoding::Brotli,
            3 => ContentEncoding::Zstd,
            255 => ContentEncoding::Custom,
            _ => return None,
        })
    }
}

/// Variant capability bits.
pub const CAP_IDENTITY: u32 = 1 << 0;
pub const CAP_GZIP: u32 = 1 << 1;
pub const CAP_ESI_FLATTENED: u32 = 1 << 2;
pub const CAP_RANGE_READY: u32 = 1 << 3;
pub const CAP_ZERO_COPY: u32 = 1 << 4;
pub const CAP_TLS_OFFLOAD: u32 = 1 << 5;

/// Manifest-level flags.
pub const FLAG_HAS_VARIANTS: u32 = 1 << 0;
pub const FLAG_LEGACY_FALLBACK: u32 = 1 << 1;

/// One deliverable body of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantDescriptor {
    /// NUL-padded identifier; the first NUL terminates it.
    pub variant_id: [u8; VARIANT_ID_MAX],
    pub capabilities: u32,
    pub encoding: u32,
    /// Bytes exposed to clients.
    pub logical_length: u64,
    /// Bytes stored on disk.
    pub storage_length: u64,
    /// Chunk size for range-ready variants.
    pub range_granularity: u64,
    pub is_primary: u8,
}

impl Default for VariantDescriptor {
    fn default() -> Self {
        VariantDescriptor {
            variant_id: [0; VARIANT_ID_MAX],
            capabilities: 0,
            encoding: ContentEncoding::Identity as u32,
            logical_length: 0,
            storage_length: 0,
            range_granularity: 0,
            is_primary: 0,
        }
    }
}

impl VariantDescriptor {
    /// Build a variant with `id` copied into the NUL-padded slot.
    /// Identifiers longer than the slot are truncated.
    pub fn with_id(id: &str) -> VariantDescriptor {
        let mut variant = VariantDescriptor::default();
        let bytes = id.as_bytes();
        let len = bytes.len().min(VARIANT_ID_MAX - 1);
        variant.variant_id[..len].copy_from_slice(&bytes[..len]);
        variant
    }

    pub fn id_str(&self) -> &str {
        let end = self
            .variant_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(VARIANT_ID_MAX);
        std::str::from_utf8(&self.variant_id[..end]).unwrap_or("")
    }
}

/// Aggregate descriptor of all delivery variants for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadDescriptor {
    pub version: u32,
    pub variant_count: u32,
    pub manifest_flags: u32,
    pub reserved: u32,
    pub variants: [VariantDescriptor; MAX_VARIANTS],
}

impl Default for PayloadDescriptor {
    fn default() -> Self {
        PayloadDescriptor {
            version: PAYLOAD_DESCRIPTOR_VERSION,
            variant_count: 0,
            manifest_flags: 0,
            reserved: 0,
            variants: [VariantDescriptor::default(); MAX_VARIANTS],
        }
    }
}

impl PayloadDescriptor {
    /// Single identity variant covering the whole stored body. Seeded on
    /// the first size-bearing write when no descriptor was set explicitly.
    pub fn identity(size_bytes: u64) -> PayloadDescriptor {
        let mut variant = VariantDescriptor::with_id("identity");
        variant.capabilities = CAP_IDENTITY | CAP_ZERO_COPY;
        variant.encoding = ContentEncoding::Identity as u32;
        variant.logical_length = size_bytes;
        variant.storage_length = size_bytes;
        variant.is_primary = 1;

        let mut descriptor = PayloadDescriptor {
            variant_count: 1,
            manifest_flags: FLAG_HAS_VARIANTS | FLAG_LEGACY_FALLBACK,
            ..PayloadDescriptor::default()
        };
        descriptor.variants[0] = variant;
        descriptor
    }

    pub fn active_variants(&self) -> &[VariantDescriptor] {
        &self.variants[..self.variant_count.min(MAX_VARIANTS as u32) as usize]
    }

    /// Check every schema rule; returns a description of the first
    /// violation found.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != PAYLOAD_DESCRIPTOR_VERSION {
            return Err(format!(
                "unexpected version {} (expected {})",
                self.version, PAYLOAD_DESCRIPTOR_VERSION
            ));
        }
        if self.variant_count == 0 {
            return Err("variant_count must be > 0".into());
        }
        if self.variant_count > MAX_VARIANTS as u32 {
            return Err(format!(
                "variant_count ({}) exceeds maximum ({})",
                self.variant_count, MAX_VARIANTS
            ));
        }

        let mut primary_count = 0usize;
        for (index, variant) in self.active_variants().iter().enumerate() {
            if variant.variant_id[0] == 0 {
                return Err(format!("variant[{index}]: variant_id missing"));
            }
            if variant.logical_length == 0 {
                return Err(format!("variant[{index}]: logical_length must be > 0"));
            }
            if variant.storage_length == 0 {
                return Err(format!("variant[{index}]: storage_length must be > 0"));
            }
            let Some(encoding) = ContentEncoding::from_u32(variant.encoding) else {
                return Err(format!(
                    "variant[{index}]: unsupported encoding {}",
                    variant.encoding
                ));
            };
            if encoding == ContentEncoding::Identity
                && variant.storage_length < variant.logical_length
            {
                return Err(format!(
                    "variant[{index}]: storage_length ({}) < logical_length ({}) for identity encoding",
                    variant.storage_length, variant.logical_length
                ));
            }
            if variant.capabilities & CAP_IDENTITY != 0 && encoding != ContentEncoding::Identity {
                return Err(format!(
                    "variant[{index}]: identity capability requires identity encoding"
                ));
            }
            if variant.capabilities & CAP_GZIP != 0 && encoding != ContentEncoding::Gzip {
                return Err(format!(
                    "variant[{index}]: gzip capability requires gzip encoding"
                ));
            }
            if variant.capabilities & CAP_RANGE_READY != 0 && variant.range_granularity == 0 {
                return Err(format!(
                    "variant[{index}]: range-ready capability requires range_granularity"
                ));
            }
            if variant.is_primary != 0 {
                primary_count += 1;
            }
        }

        match primary_count {
            0 => Err("no primary variant defined".into()),
            1 => Ok(()),
            n => Err(format!("multiple primary variants defined ({n})")),
        }
    }

    /// Encode as the fixed little-endian blob. All [`MAX_VARIANTS`] slots
    /// are emitted; inactive slots are zero.
    pub fn encode(&self) -> Result<[u8; DESCRIPTOR_WIRE_SIZE], String> {
        if self.variant_count > MAX_VARIANTS as u32 {
            return Err("variant_count exceeds maximum".into());
        }

        let mut buf = [0u8; DESCRIPTOR_WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.variant_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.manifest_flags.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reserved.to_le_bytes());

        for (index, variant) in self.variants.iter().enumerate() {
            let base = 16 + index * VARIANT_WIRE_SIZE;
            let slot = &mut buf[base..base + VARIANT_WIRE_SIZE];
            slot[0..VARIANT_ID_MAX].copy_from_slice(&variant.variant_id);
            slot[32..36].copy_from_slice(&variant.capabilities.to_le_bytes());
            slot[36..40].copy_from_slice(&variant.encoding.to_le_bytes());
            slot[40..48].copy_from_slice(&variant.logical_length.to_le_bytes());
            slot[48..56].copy_from_slice(&variant.storage_length.to_le_bytes());
            slot[56..64].copy_from_slice(&variant.range_granularity.to_le_bytes());
            slot[64] = variant.is_primary;
            // bytes 65..72 reserved, already zero
        }

        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<PayloadDescriptor, String> {
        if buf.len() < DESCRIPTOR_WIRE_SIZE {
            return Err(format!(
                "descriptor blob too short ({} < {})",
                buf.len(),
                DESCRIPTOR_WIRE_SIZE
            ));
        }

        let word = |range: std::ops::Range<usize>| -> u32 {
            u32::from_le_bytes(buf[range].try_into().unwrap_or([0; 4]))
        };

        let mut descriptor = PayloadDescriptor {
            version: word(0..4),
            variant_count: word(4..8),
            manifest_flags: word(8..12),
            reserved: word(12..16),
            ..PayloadDescriptor::default()
        };

        if descriptor.variant_count > MAX_VARIANTS as u32 {
            return Err("variant_count exceeds maximum".into());
        }

        for index in 0..MAX_VARIANTS {
            let base = 16 + index * VARIANT_WIRE_SIZE;
            let slot = &buf[base..base + VARIANT_WIRE_SIZE];
            let variant = &mut descriptor.variants[index];
            variant.variant_id.copy_from_slice(&slot[0..VARIANT_ID_MAX]);
            // Guarantee NUL termination even for hostile input.
            variant.variant_id[VARIANT_ID_MAX - 1] = 0;
            variant.capabilities = u32::from_le_bytes(slot[32..36].try_into().unwrap_or([0; 4]));
            variant.encoding = u32::from_le_bytes(slot[36..40].try_into().unwrap_or([0; 4]));
            variant.logical_length = u64::from_le_bytes(slot[40..48].try_into().unwrap_or([0; 8]));
            variant.storage_length = u64::from_le_bytes(slot[48..56].try_into().unwrap_or([0; 8]));
            variant.range_granularity =
                u64::from_le_bytes(slot[56..64].try_into().unwrap_or([0; 8]));
            variant.is_primary = slot[64];
        }

        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn two_variant_descriptor() -> PayloadDescriptor {
        let mut descriptor = PayloadDescriptor::default();
        descriptor.variant_count = 2;
        descriptor.manifest_flags = FLAG_HAS_VARIANTS;

        let mut identity = VariantDescriptor::with_id("identity");
        identity.capabilities = CAP_IDENTITY | CAP_ZERO_COPY;
        identity.logical_length = 4096;
        identity.storage_length = 4096;
        identity.is_primary = 1;
        descriptor.variants[0] = identity;

        let mut gzip = VariantDescriptor::with_id("gzip-9");
        gzip.capabilities = CAP_GZIP;
        gzip.encoding = ContentEncoding::Gzip as u32;
        gzip.logical_length = 4096;
        gzip.storage_length = 1200;
        descriptor.variants[1] = gzip;

        descriptor
    }

    #[test]
    fn test_identity_seed_validates() {
        assert!(PayloadDescriptor::identity(17).validate().is_ok());
    }

    #[test]
    fn test_two_variant_descriptor_validates() {
        assert!(two_variant_descriptor().validate().is_ok());
    }

    #[test]
    fn test_missing_primary_rejected() {
        let mut descriptor = two_variant_descriptor();
        descriptor.variants[0].is_primary = 0;
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_multiple_primaries_rejected() {
        let mut descriptor = two_variant_descriptor();
        descriptor.variants[1].is_primary = 1;
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_identity_cap_requires_identity_encoding() {
        let mut descriptor = two_variant_descriptor();
        descriptor.variants[0].encoding = ContentEncoding::Zstd as u32;
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_range_ready_requires_granularity() {
        let mut descriptor = two_variant_descriptor();
        descriptor.variants[0].capabilities |= CAP_RANGE_READY;
        assert!(descriptor.validate().is_err());
        descriptor.variants[0].range_granularity = 65536;
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_identity_storage_shorter_than_logical_rejected() {
        let mut descriptor = two_variant_descriptor();
        descriptor.variants[0].storage_length = 100;
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_zero_variants_rejected() {
        assert!(PayloadDescriptor::default().validate().is_err());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let descriptor = two_variant_descriptor();
        let blob = descriptor.encode().unwrap();
        assert_eq!(blob.len(), DESCRIPTOR_WIRE_SIZE);
        let decoded = PayloadDescriptor::decode(&blob).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn test_decode_short_blob_rejected() {
        assert!(PayloadDescriptor::decode(&[0u8; 10]).is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_descriptors_round_trip(
            count in 1u32..=MAX_VARIANTS as u32,
            primary in 0usize..MAX_VARIANTS,
            lengths in proptest::collection::vec(1u64..1 << 40, MAX_VARIANTS),
        ) {
            let primary = primary % count as usize;
            let mut descriptor = PayloadDescriptor::default();
            descriptor.variant_count = count;
            descriptor.manifest_flags = FLAG_HAS_VARIANTS;
            for index in 0..count as usize {
                let mut variant = VariantDescriptor::with_id(&format!("variant-{index}"));
                variant.logical_length = lengths[index];
                variant.storage_length = lengths[index];
                variant.is_primary = u8::from(index == primary);
                descriptor.variants[index] = variant;
            }

            prop_assert!(descriptor.validate().is_ok());
            let blob = descriptor.encode().unwrap();
            let decoded = PayloadDescriptor::decode(&blob).unwrap();
            prop_assert_eq!(decoded, descriptor);
        }
    }
}
