//! Client side of the wire protocol.
//!
//! A [`ClientConnection`] owns the socket, performs the V2 hello when
//! asked, and correlates responses either in order ([`recv_response`]) or
//! by request id ([`recv_response_for`]) when out-of-order replies were
//! negotiated. Responses that arrive while waiting for a specific id are
//! parked in a bounded table sized to the negotiated pipeline depth.
//!
//! [`recv_response`]: ClientConnection::recv_response
//! [`recv_response_for`]: ClientConnection::recv_response_for

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use log::debug;

use crate::error::{MapperError, Result, Status};
use crate::fdpass;
use crate::protocol::{
    segment, stream_read, stream_write, Hello, Params, Request, Response, Version,
    CAP_OOO_REPLIES, CAP_SEGMENTED_DELIVERY, MAGIC, MAX_URI_LEN, MSG_CLOSE, MSG_CLOSE_ACK,
    MSG_REQUEST, MSG_RESPONSE, MSG_SEGMENTED_RESPONSE, VERSION_2,
};

pub struct ClientConnection {
    stream: UnixStream,
    params: Params,
    next_request_id: u32,
    /// Parked responses indexed by request id (OOO mode only).
    pending: Vec<Option<Response>>,
}

impl ClientConnection {
    /// Connect to a server socket. V1 connections need no handshake; V2
    /// connections must call [`hello`](Self::hello) before any request.
    pub fn connect(path: impl AsRef<Path>, version: Version) -> Result<ClientConnection> {
        let stream = UnixStream::connect(path)?;
        Ok(ClientConnection::from_stream(stream, version))
    }

    pub fn from_stream(stream: UnixStream, version: Version) -> ClientConnection {
        ClientConnection {
            stream,
            params: Params {
                version,
                ..Params::v1()
            },
            next_request_id: 1,
            pending: Vec::new(),
        }
    }

    pub fn params(&self) -> Params {
        self.params
    }

    pub fn has_capability(&self, capability: u16) -> bool {
        self.params.has_capability(capability)
    }

    /// Monotonically increasing request ids for V2 pipelining.
    pub fn allocate_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    /// V2 handshake: send HELLO, receive HELLO_ACK, adopt the negotiated
    /// parameters.
    pub fn hello(&mut self, hello: &Hello) -> Result<Params> {
        if self.params.version != Version::V2 {
            return Err(MapperError::Protocol("hello is a V2 operation".into()));
        }

        let mut msg = [0u8; 9];
        msg[0..4].copy_from_slice(&MAGIC);
        msg[4] = VERSION_2;
        msg[5..7].copy_from_slice(&hello.capabilities.to_be_bytes());
        msg[7..9].copy_from_slice(&hello.max_pipeline.to_be_bytes());
        stream_write(&self.stream, &msg)?;

        let mut ack = [0u8; 10];
        stream_read(&self.stream, &mut ack)?;
        if ack[0..4] != MAGIC {
            return Err(MapperError::Protocol("invalid HELLO_ACK magic".into()));
        }
        if ack[4] != VERSION_2 {
            return Err(MapperError::VersionMismatch(ack[4]));
        }

        self.params = Params {
            version: Version::V2,
            capabilities: u16::from_be_bytes([ack[5], ack[6]]),
            max_pipeline: u16::from_be_bytes([ack[7], ack[8]]),
            backend_parallelism: ack[9],
        };

        if self.params.has_capability(CAP_OOO_REPLIES) {
            self.pending = Vec::new();
            self.pending
                .resize_with(usize::from(self.params.max_pipeline) + 1, || None);
        }

        debug!(
            "negotiated v2: caps={} pipeline={} parallelism={}",
            crate::protocol::capability_names(self.params.capabilities),
            self.params.max_pipeline,
            self.params.backend_parallelism
        );
        Ok(self.params)
    }

    pub fn send_request(&mut self, request: &Request) -> Result<()> {
        let uri = request.uri.as_bytes();
        if uri.len() > MAX_URI_LEN {
            return Err(MapperError::UriTooLong(uri.len()));
        }

        match self.params.version {
            Version::V1 => {
                let mut header = [0u8; 3];
                header[0] = request.mode;
                header[1..3].copy_from_slice(&(uri.len() as u16).to_be_bytes());
                stream_write(&self.stream, &header)?;
                stream_write(&self.stream, uri)?;
            }
            Version::V2 => {
                let mut header = [0u8; 9];
                header[0] = MSG_REQUEST;
                header[1..5].copy_from_slice(&request.id.to_be_bytes());
                header[5] = request.flags;
                header[6] = request.mode;
                header[7..9].copy_from_slice(&(uri.len() as u16).to_be_bytes());
                stream_write(&self.stream, &header)?;
                stream_write(&self.stream, uri)?;
            }
        }
        Ok(())
    }

    /// Receive the next response off the wire, whatever its id.
    pub fn recv_response(&mut self) -> Result<Response> {
        match self.params.version {
            Version::V1 => self.recv_v1_response(),
            Version::V2 => self.recv_v2_response(),
        }
    }

    /// Receive the response for `request_id` specifically, parking any
    /// other responses that arrive first. An already-parked response is
    /// returned without touching the socket.
    pub fn recv_response_for(&mut self, request_id: u32) -> Result<Response> {
        if self.params.version != Version::V2 {
            return Err(MapperError::Protocol(
                "response correlation requires V2".into(),
            ));
        }

        if let Some(slot) = self.pending.get_mut(request_id as usize) {
            if let Some(response) = slot.take() {
                return Ok(response);
            }
        }

        loop {
            let response = self.recv_v2_response()?;
            if response.request_id == request_id {
                return Ok(response);
            }
            match self.pending.get_mut(response.request_id as usize) {
                Some(slot) => *slot = Some(response),
                // Out of the pipeline window; drop it (closing any FD).
                None => drop(response),
            }
        }
    }

    /// Graceful V2 close: send CLOSE, wait for CLOSE_ACK, return the
    /// server's outstanding-response count. A no-op on V1.
    pub fn close(&mut self, reason: u8) -> Result<u32> {
        if self.params.version != Version::V2 {
            return Ok(0);
        }

        stream_write(&self.stream, &[MSG_CLOSE, reason])?;

        let mut ack = [0u8; 6];
        stream_read(&self.stream, &mut ack)?;
        if ack[0] != MSG_CLOSE_ACK {
            return Err(MapperError::Protocol(format!(
                "expected CLOSE_ACK, got message type {:#04x}",
                ack[0]
            )));
        }
        Ok(u32::from_be_bytes([ack[2], ack[3], ack[4], ack[5]]))
    }

    fn recv_v1_response(&mut self) -> Result<Response> {
        let mut header = [0u8; 11];
        stream_read(&self.stream, &mut header)?;

        let status = Status::from_u8(header[0])
            .ok_or_else(|| MapperError::Protocol(format!("unknown status {:#04x}", header[0])))?;
        let content_len = u64::from_be_bytes(header[1..9].try_into().unwrap_or([0; 8]));
        let metadata_len = u16::from_be_bytes([header[9], header[10]]) as usize;

        let mut response = Response::new(0, status);
        response.content_len = content_len;
        response.metadata = self.recv_metadata(metadata_len)?;

        if status == Status::Ok && content_len == 0 {
            let (fd, _tag) = fdpass::recv_fd(self.stream.as_fd())?;
            response.fd = Some(fd);
        }
        Ok(response)
    }

    fn recv_v2_response(&mut self) -> Result<Response> {
        let mut base = [0u8; 6];
        stream_read(&self.stream, &mut base)?;

        let msg_type = base[0];
        let request_id = u32::from_be_bytes(base[1..5].try_into().unwrap_or([0; 4]));
        let status = Status::from_u8(base[5])
            .ok_or_else(|| MapperError::Protocol(format!("unknown status {:#04x}", base[5])))?;

        let mut response = Response::new(request_id, status);

        match msg_type {
            MSG_RESPONSE => {
                let mut tail = [0u8; 10];
                stream_read(&self.stream, &mut tail)?;
                response.content_len = u64::from_be_bytes(tail[0..8].try_into().unwrap_or([0; 8]));
                let metadata_len = u16::from_be_bytes([tail[8], tail[9]]) as usize;
                response.metadata = self.recv_metadata(metadata_len)?;

                if status == Status::Ok && response.content_len == 0 {
                    let (fd, _tag) = fdpass::recv_fd(self.stream.as_fd())?;
                    response.fd = Some(fd);
                }
            }
            MSG_SEGMENTED_RESPONSE => {
                if !self.params.has_capability(CAP_SEGMENTED_DELIVERY) {
                    return Err(MapperError::Capability(
                        "segmented response without capability".into(),
                    ));
                }
                let mut tail = [0u8; 4];
                stream_read(&self.stream, &mut tail)?;
                let segment_count = u16::from_be_bytes([tail[0], tail[1]]);
                let metadata_len = u16::from_be_bytes([tail[2], tail[3]]) as usize;
                response.metadata = self.recv_metadata(metadata_len)?;

                let (segments, content_len) = segment::recv_segments(&self.stream, segment_count)?;
                response.segments = segments;
                response.content_len = content_len;
            }
            other => {
                return Err(MapperError::Protocol(format!(
                    "unexpected message type: {other:#04x}"
                )));
            }
        }

        Ok(response)
    }

    fn recv_metadata(&mut self, metadata_len: usize) -> Result<Vec<u8>> {
        let mut metadata = vec![0u8; metadata_len];
        if metadata_len > 0 {
            stream_read(&self.stream, &mut metadata)?;
        }
        Ok(metadata)
    }
}
