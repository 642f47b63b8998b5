//! Segmented-response encoding.
//!
//! A segmented response interleaves inline bytes and passed descriptors to
//! assemble one logical object body. The frame carries a table of 32-byte
//! segment headers, then every inline payload in order, then one
//! `SCM_RIGHTS` message per descriptor-bearing segment that does not reuse
//! the previous descriptor.
//!
//! Validity rules:
//! - INLINE: `copy_length == logical_length`, payload bytes follow inline.
//! - FD/SPLICE: `copy_length == 0`, `storage_length >= logical_length`.
//! - REUSE_FD only after a segment that actually supplied a descriptor.
//! - The final segment carries FIN; no segment may follow a FIN.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use crate::error::{MapperError, Result};
use crate::fdpass;
use crate::protocol::{stream_read, stream_write};

pub const SEGMENT_HEADER_WIRE_SIZE: usize = 32;
pub const MAX_SEGMENTS: usize = 64;

/// Segment types.
pub const SEG_INLINE: u8 = 0;
pub const SEG_FD: u8 = 1;
pub const SEG_SPLICE: u8 = 2;

/// Segment flags.
pub const SEG_FLAG_FIN: u8 = 0x01;
pub const SEG_FLAG_REUSE_FD: u8 = 0x02;
pub const SEG_FLAG_OPTIONAL: u8 = 0x04;

/// One segment of a segmented response.
#[derive(Debug)]
pub struct Segment {
    pub kind: u8,
    pub flags: u8,
    /// Bytes of inline payload (INLINE only).
    pub copy_length: u32,
    /// Bytes this segment contributes to the client-visible body.
    pub logical_length: u64,
    /// Offset within the referenced descriptor.
    pub storage_offset: u64,
    /// Bytes available from the descriptor.
    pub storage_length: u64,
    pub inline_data: Vec<u8>,
    /// Owned descriptor; `None` for INLINE and REUSE_FD segments.
    pub fd: Option<OwnedFd>,
}

impl Segment {
    pub fn inline(data: Vec<u8>, flags: u8) -> Segment {
        let len = data.len();
        Segment {
            kind: SEG_INLINE,
            flags,
            copy_length: len as u32,
            logical_length: len as u64,
            storage_offset: 0,
            storage_length: 0,
            inline_data: data,
            fd: None,
        }
    }

    pub fn from_fd(
        fd: OwnedFd,
        logical_length: u64,
        storage_offset: u64,
        storage_length: u64,
        flags: u8,
    ) -> Segment {
        Segment {
            kind: SEG_FD,
            flags,
            copy_length: 0,
            logical_length,
            storage_offset,
            storage_length,
            inline_data: Vec::new(),
            fd: Some(fd),
        }
    }

    pub fn is_fin(&self) -> bool {
        self.flags & SEG_FLAG_FIN != 0
    }

    pub fn reuses_fd(&self) -> bool {
        self.flags & SEG_FLAG_REUSE_FD != 0
    }
}

/// The descriptor backing segment `index`, following REUSE_FD links back
/// to the most recent segment that supplied one.
pub fn resolved_fd(segments: &[Segment], index: usize) -> Option<BorrowedFd<'_>> {
    if segments.is_empty() {
        return None;
    }
    for segment in segments[..=index.min(segments.len() - 1)].iter().rev() {
        if segment.kind != SEG_FD && segment.kind != SEG_SPLICE {
            continue;
        }
        if let Some(fd) = &segment.fd {
            return Some(fd.as_fd());
        }
        if !segment.reuses_fd() {
            return None;
        }
    }
    None
}

fn validate(segments: &[Segment]) -> Result<()> {
    if segments.is_empty() || segments.len() > MAX_SEGMENTS {
        return Err(MapperError::Protocol(format!(
            "invalid segment count: {}",
            segments.len()
        )));
    }

    let mut have_fd = false;
    for (index, segment) in segments.iter().enumerate() {
        if index + 1 < segments.len() && segment.is_fin() {
            return Err(MapperError::Protocol("segment after FIN".into()));
        }
        match segment.kind {
            SEG_INLINE => {
                if u64::from(segment.copy_length) != segment.logical_length {
                    return Err(MapperError::Protocol("inline segment length mismatch".into()));
                }
            }
            SEG_FD | SEG_SPLICE => {
                if segment.copy_length != 0 {
                    return Err(MapperError::Protocol(
                        "copy length must be zero for FD segments".into(),
                    ));
                }
                if segment.storage_length < segment.logical_length {
                    return Err(MapperError::Protocol("storage length < logical length".into()));
                }
                if segment.reuses_fd() {
                    if !have_fd {
                        return Err(MapperError::Protocol(
                            "FD reuse without prior descriptor".into(),
                        ));
                    }
                } else {
                    have_fd = true;
                }
            }
            kind => {
                return Err(MapperError::Protocol(format!(
                    "unknown segment type: {kind}"
                )));
            }
        }
    }

    if !segments[segments.len() - 1].is_fin() {
        return Err(MapperError::Protocol("final segment missing FIN flag".into()));
    }
    Ok(())
}

/// Encode one segment header into its 32-byte wire slot.
fn encode_header(segment: &Segment, slot: &mut [u8]) {
    slot[0] = segment.kind;
    slot[1] = segment.flags;
    slot[2] = 0;
    slot[3] = 0;
    slot[4..8].copy_from_slice(&segment.copy_length.to_be_bytes());
    slot[8..16].copy_from_slice(&segment.logical_length.to_be_bytes());
    slot[16..24].copy_from_slice(&segment.storage_offset.to_be_bytes());
    slot[24..32].copy_from_slice(&segment.storage_length.to_be_bytes());
}

fn decode_header(slot: &[u8]) -> Segment {
    Segment {
        kind: slot[0],
        flags: slot[1],
        copy_length: u32::from_be_bytes(slot[4..8].try_into().unwrap_or([0; 4])),
        logical_length: u64::from_be_bytes(slot[8..16].try_into().unwrap_or([0; 8])),
        storage_offset: u64::from_be_bytes(slot[16..24].try_into().unwrap_or([0; 8])),
        storage_length: u64::from_be_bytes(slot[24..32].try_into().unwrap_or([0; 8])),
        inline_data: Vec::new(),
        fd: None,
    }
}

/// Send the segment table, inline payloads, and descriptors. Validates
/// the whole set before the first byte goes out.
pub fn send_segments(stream: &UnixStream, segments: &[Segment]) -> Result<()> {
    validate(segments)?;

    // Segments that will travel an FD must actually hold one.
    for segment in segments {
        if (segment.kind == SEG_FD || segment.kind == SEG_SPLICE)
            && !segment.reuses_fd()
            && segment.fd.is_none()
        {
            return Err(MapperError::Protocol(
                "segment missing file descriptor".into(),
            ));
        }
        if segment.kind == SEG_INLINE
            && segment.inline_data.len() != segment.copy_length as usize
        {
            return Err(MapperError::Protocol("inline segment missing payload".into()));
        }
    }

    let mut table = vec![0u8; segments.len() * SEGMENT_HEADER_WIRE_SIZE];
    for (index, segment) in segments.iter().enumerate() {
        let base = index * SEGMENT_HEADER_WIRE_SIZE;
        encode_header(segment, &mut table[base..base + SEGMENT_HEADER_WIRE_SIZE]);
    }
    stream_write(stream, &table)?;

    for segment in segments {
        if segment.kind == SEG_INLINE && !segment.inline_data.is_empty() {
            stream_write(stream, &segment.inline_data)?;
        }
    }

    for segment in segments {
        if let Some(fd) = &segment.fd {
            fdpass::send_fd(stream.as_fd(), fd.as_fd(), b'X')?;
        }
    }

    Ok(())
}

/// Receive `count` segments: table, inline payloads, then descriptors.
/// Returns the segments plus the summed logical body length.
pub fn recv_segments(stream: &UnixStream, count: u16) -> Result<(Vec<Segment>, u64)> {
    let count = count as usize;
    if count == 0 || count > MAX_SEGMENTS {
        return Err(MapperError::Protocol(format!(
            "invalid segment count: {count}"
        )));
    }

    let mut table = vec![0u8; count * SEGMENT_HEADER_WIRE_SIZE];
    stream_read(stream, &mut table)?;

    let mut segments: Vec<Segment> = table
        .chunks_exact(SEGMENT_HEADER_WIRE_SIZE)
        .map(decode_header)
        .collect();
    validate(&segments)?;

    let content_len = segments.iter().map(|s| s.logical_length).sum();

    for segment in &mut segments {
        if segment.kind == SEG_INLINE && segment.copy_length > 0 {
            let mut data = vec![0u8; segment.copy_length as usize];
            stream_read(stream, &mut data)?;
            segment.inline_data = data;
        }
    }

    for index in 0..segments.len() {
        let segment = &segments[index];
        if segment.kind != SEG_FD && segment.kind != SEG_SPLICE {
            continue;
        }
        if segment.reuses_fd() {
            continue;
        }
        let (fd, _tag) = fdpass::recv_fd(stream.as_fd())?;
        segments[index].fd = Some(fd);
    }

    Ok((segments, content_len))
}
