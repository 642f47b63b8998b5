//! The objmapper wire protocol.
//!
//! Two framings share one socket: V1 is a bare ordered request/response
//! exchange with no handshake; V2 opens with an `OBJM` hello, negotiates
//! capabilities and pipeline depth, and supports out-of-order responses
//! and segmented delivery. All integers on the wire are big-endian.
//!
//! Layouts (sizes in bytes):
//!
//! ```text
//! V1 request    mode:1  uri_len:2  uri
//! V1 response   status:1  content_len:8  metadata_len:2  [metadata] [FD]
//! V2 hello      "OBJM"  version:1  capabilities:2  max_pipeline:2
//! V2 hello-ack  "OBJM"  version:1  capabilities:2  max_pipeline:2  parallelism:1
//! V2 request    type:1  request_id:4  flags:1  mode:1  uri_len:2  uri
//! V2 response   type:1  request_id:4  status:1  content_len:8  metadata_len:2 ...
//! V2 segmented  type:1  request_id:4  status:1  segment_count:2  metadata_len:2 ...
//! V2 close      type:1  reason:1
//! V2 close-ack  type:1  reserved:1  outstanding:4
//! ```

pub mod client;
pub mod segment;
pub mod server;
pub mod tlv;

pub use client::ClientConnection;
pub use segment::{
    Segment, MAX_SEGMENTS, SEGMENT_HEADER_WIRE_SIZE, SEG_FD, SEG_FLAG_FIN, SEG_FLAG_OPTIONAL,
    SEG_FLAG_REUSE_FD, SEG_INLINE, SEG_SPLICE,
};
pub use server::{Received, ServerConnection};

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use crate::error::Status;

/// Write the whole buffer to the stream (short writes break the
/// connection; there is no replay).
pub(crate) fn stream_write(stream: &UnixStream, buf: &[u8]) -> crate::error::Result<()> {
    use std::io::Write;
    let mut stream = stream;
    stream.write_all(buf)?;
    Ok(())
}

/// Fill the whole buffer from the stream; EOF mid-frame is an error.
pub(crate) fn stream_read(stream: &UnixStream, buf: &mut [u8]) -> crate::error::Result<()> {
    use std::io::Read;
    let mut stream = stream;
    stream.read_exact(buf)?;
    Ok(())
}

pub const MAGIC: [u8; 4] = *b"OBJM";

pub const VERSION_1: u8 = 0x01;
pub const VERSION_2: u8 = 0x02;

/// Capability flags (V2 hello negotiation).
pub const CAP_OOO_REPLIES: u16 = 0x0001;
pub const CAP_PIPELINING: u16 = 0x0002;
pub const CAP_COMPRESSION: u16 = 0x0004;
pub const CAP_MULTIPLEXING: u16 = 0x0008;
pub const CAP_SEGMENTED_DELIVERY: u16 = 0x0010;

/// Request flags.
/// Force an in-order response.
pub const REQ_ORDERED: u8 = 0x01;
/// High-priority request.
pub const REQ_PRIORITY: u8 = 0x02;

/// Message types (V2).
pub const MSG_REQUEST: u8 = 0x01;
pub const MSG_RESPONSE: u8 = 0x02;
pub const MSG_CLOSE: u8 = 0x03;
pub const MSG_CLOSE_ACK: u8 = 0x04;
pub const MSG_SEGMENTED_RESPONSE: u8 = 0x05;

/// Operation modes.
pub const MODE_FDPASS: u8 = b'1';
pub const MODE_COPY: u8 = b'2';
pub const MODE_SPLICE: u8 = b'3';
pub const MODE_SEGMENTED: u8 = b'4';

/// Close reasons.
pub const CLOSE_NORMAL: u8 = 0x00;
pub const CLOSE_TIMEOUT: u8 = 0x01;
pub const CLOSE_ERROR: u8 = 0x02;
pub const CLOSE_SHUTDOWN: u8 = 0x03;

/// Limits.
pub const MAX_URI_LEN: usize = 4096;
pub const MAX_PIPELINE: u16 = 1000;
pub const MAX_METADATA: usize = 1024;

/// Protocol version of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Simple ordered exchange, no handshake.
    V1,
    /// Pipelined with capability negotiation and OOO replies.
    V2,
}

impl Version {
    pub fn wire_byte(self) -> u8 {
        match self {
            Version::V1 => VERSION_1,
            Version::V2 => VERSION_2,
        }
    }
}

/// One side's hello parameters.
#[derive(Debug, Clone, Copy)]
pub struct Hello {
    pub capabilities: u16,
    pub max_pipeline: u16,
    /// Server only: count of enabled persistent backends.
    pub backend_parallelism: u8,
}

/// Negotiated connection parameters.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    pub version: Version,
    pub capabilities: u16,
    pub max_pipeline: u16,
    pub backend_parallelism: u8,
}

impl Params {
    pub fn v1() -> Params {
        Params {
            version: Version::V1,
            capabilities: 0,
            max_pipeline: 1,
            backend_parallelism: 1,
        }
    }

    pub fn has_capability(&self, capability: u16) -> bool {
        self.capabilities & capability != 0
    }
}

/// A request frame.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request id (V2 only; 0 on V1).
    pub id: u32,
    pub flags: u8,
    pub mode: u8,
    pub uri: String,
}

impl Request {
    pub fn fdpass(id: u32, uri: impl Into<String>) -> Request {
        Request {
            id,
            flags: 0,
            mode: MODE_FDPASS,
            uri: uri.into(),
        }
    }
}

/// A response frame. Owns its received descriptor(s) until the caller
/// moves them out; dropping an unread response closes them.
#[derive(Debug)]
pub struct Response {
    pub request_id: u32,
    pub status: Status,
    /// Descriptor for FD-pass responses.
    pub fd: Option<OwnedFd>,
    /// Segments for segmented delivery (empty otherwise).
    pub segments: Vec<Segment>,
    pub content_len: u64,
    pub metadata: Vec<u8>,
}

impl Response {
    pub fn new(request_id: u32, status: Status) -> Response {
        Response {
            request_id,
            status,
            fd: None,
            segments: Vec::new(),
            content_len: 0,
            metadata: Vec::new(),
        }
    }

    /// An OK FD-pass response (`content_len == 0` by contract).
    pub fn ok_fd(request_id: u32, fd: OwnedFd) -> Response {
        Response {
            fd: Some(fd),
            ..Response::new(request_id, Status::Ok)
        }
    }

    /// An error response carrying `message` in the error TLV.
    pub fn error(request_id: u32, status: Status, message: &str) -> Response {
        let mut metadata = tlv::MetadataBuf::new();
        metadata.add_error(message);
        Response {
            metadata: metadata.into_bytes(),
            ..Response::new(request_id, status)
        }
    }

    /// Move the received descriptor out of the response.
    pub fn take_fd(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    /// The peer's error TLV, if any.
    pub fn error_message(&self) -> Option<String> {
        let entries = tlv::parse(&self.metadata).ok()?;
        tlv::get(&entries, tlv::META_ERROR)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    pub fn is_segmented(&self) -> bool {
        !self.segments.is_empty()
    }
}

/// Human-readable capability set, for log lines.
pub fn capability_names(capabilities: u16) -> String {
    const NAMES: [(u16, &str); 5] = [
        (CAP_OOO_REPLIES, "ooo-replies"),
        (CAP_PIPELINING, "pipelining"),
        (CAP_COMPRESSION, "compression"),
        (CAP_MULTIPLEXING, "multiplexing"),
        (CAP_SEGMENTED_DELIVERY, "segmented-delivery"),
    ];
    let mut out = Vec::new();
    for (bit, name) in NAMES {
        if capabilities & bit != 0 {
            out.push(name);
        }
    }
    if out.is_empty() {
        "none".to_owned()
    } else {
        out.join("|")
    }
}

/// Human-readable mode name.
pub fn mode_name(mode: u8) -> &'static str {
    match mode {
        MODE_FDPASS => "fdpass",
        MODE_COPY => "copy",
        MODE_SPLICE => "splice",
        MODE_SEGMENTED => "segmented",
        _ => "unknown",
    }
}

/// Human-readable close reason.
pub fn close_reason_name(reason: u8) -> &'static str {
    match reason {
        CLOSE_NORMAL => "normal",
        CLOSE_TIMEOUT => "timeout",
        CLOSE_ERROR => "error",
        CLOSE_SHUTDOWN => "shutdown",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_names() {
        assert_eq!(capability_names(0), "none");
        assert_eq!(
            capability_names(CAP_OOO_REPLIES | CAP_PIPELINING),
            "ooo-replies|pipelining"
        );
    }

    #[test]
    fn test_close_reason_names() {
        assert_eq!(close_reason_name(CLOSE_NORMAL), "normal");
        assert_eq!(close_reason_name(CLOSE_TIMEOUT), "timeout");
        assert_eq!(close_reason_name(CLOSE_ERROR), "error");
        assert_eq!(close_reason_name(CLOSE_SHUTDOWN), "shutdown");
        assert_eq!(close_reason_name(0x7F), "unknown");
    }

    #[test]
    fn test_error_response_carries_message() {
        let response = Response::error(9, Status::StorageError, "disk on fire");
        assert_eq!(response.error_message().as_deref(), Some("disk on fire"));
        assert_eq!(response.request_id, 9);
        assert!(response.fd.is_none());
    }
}
