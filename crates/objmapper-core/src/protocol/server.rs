//! Server side of the wire protocol.
//!
//! Version detection peeks one byte off the stream: the V2 hello opens
//! with the `O` of the magic, anything else is a V1 request already in
//! flight. Capability negotiation intersects the client's bits with the
//! server's and takes the minimum pipeline depth.

use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;

use log::debug;
use nix::sys::socket::{recv, MsgFlags};

use crate::error::{MapperError, Result, Status};
use crate::fdpass;
use crate::protocol::{
    segment, stream_read, stream_write, Hello, Params, Request, Response, Version,
    CAP_SEGMENTED_DELIVERY, MAGIC, MAX_URI_LEN, MSG_CLOSE, MSG_CLOSE_ACK, MSG_REQUEST,
    MSG_RESPONSE, MSG_SEGMENTED_RESPONSE, VERSION_2,
};
use crate::protocol::tlv::MetadataBuf;

/// What the request loop pulled off the wire.
#[derive(Debug)]
pub enum Received {
    Request(Request),
    Close { reason: u8 },
}

pub struct ServerConnection {
    stream: UnixStream,
    params: Params,
}

impl ServerConnection {
    pub fn new(stream: UnixStream) -> ServerConnection {
        ServerConnection {
            stream,
            params: Params::v1(),
        }
    }

    pub fn params(&self) -> Params {
        self.params
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Detect the protocol version and, for V2, run the hello exchange.
    pub fn handshake(&mut self, hello: &Hello) -> Result<Params> {
        let mut first = [0u8; 1];
        let peeked = recv(self.stream.as_fd().as_raw_fd(), &mut first, MsgFlags::MSG_PEEK)
            .map_err(|e| MapperError::Protocol(format!("peek failed: {e}")))?;
        if peeked != 1 {
            return Err(MapperError::Protocol("peer closed before handshake".into()));
        }

        if first[0] == MAGIC[0] {
            let mut msg = [0u8; 9];
            stream_read(&self.stream, &mut msg)?;
            if msg[0..4] != MAGIC {
                return Err(MapperError::Protocol("invalid HELLO magic".into()));
            }
            if msg[4] != VERSION_2 {
                return Err(MapperError::VersionMismatch(msg[4]));
            }

            let client_caps = u16::from_be_bytes([msg[5], msg[6]]);
            let client_pipeline = u16::from_be_bytes([msg[7], msg[8]]);

            self.params = Params {
                version: Version::V2,
                capabilities: client_caps & hello.capabilities,
                max_pipeline: client_pipeline.min(hello.max_pipeline),
                backend_parallelism: hello.backend_parallelism,
            };

            let mut ack = [0u8; 10];
            ack[0..4].copy_from_slice(&MAGIC);
            ack[4] = VERSION_2;
            ack[5..7].copy_from_slice(&self.params.capabilities.to_be_bytes());
            ack[7..9].copy_from_slice(&self.params.max_pipeline.to_be_bytes());
            ack[9] = self.params.backend_parallelism;
            stream_write(&self.stream, &ack)?;

            debug!(
                "client negotiated v2: caps={} pipeline={}",
                crate::protocol::capability_names(self.params.capabilities),
                self.params.max_pipeline
            );
        } else {
            // V1 speaks immediately; no handshake bytes to consume.
            self.params = Params::v1();
            debug!("client speaking v1");
        }

        Ok(self.params)
    }

    /// Receive the next frame. URI length violations surface before the
    /// URI body is read any further.
    pub fn recv_request(&mut self) -> Result<Received> {
        match self.params.version {
            Version::V1 => {
                let mut header = [0u8; 3];
                stream_read(&self.stream, &mut header)?;

                let mode = header[0];
                let uri_len = u16::from_be_bytes([header[1], header[2]]) as usize;
                let uri = self.recv_uri(uri_len)?;
                Ok(Received::Request(Request {
                    id: 0,
                    flags: 0,
                    mode,
                    uri,
                }))
            }
            Version::V2 => {
                let mut msg_type = [0u8; 1];
                stream_read(&self.stream, &mut msg_type)?;

                match msg_type[0] {
                    MSG_CLOSE => {
                        let mut reason = [0u8; 1];
                        stream_read(&self.stream, &mut reason)?;
                        Ok(Received::Close { reason: reason[0] })
                    }
                    MSG_REQUEST => {
                        let mut header = [0u8; 8];
                        stream_read(&self.stream, &mut header)?;

                        let id = u32::from_be_bytes(header[0..4].try_into().unwrap_or([0; 4]));
                        let flags = header[4];
                        let mode = header[5];
                        let uri_len = u16::from_be_bytes([header[6], header[7]]) as usize;
                        let uri = self.recv_uri(uri_len)?;
                        Ok(Received::Request(Request {
                            id,
                            flags,
                            mode,
                            uri,
                        }))
                    }
                    other => Err(MapperError::Protocol(format!(
                        "unexpected message type: {other:#04x}"
                    ))),
                }
            }
        }
    }

    /// Serialize a response. For FD-pass responses (status OK, zero
    /// content length, descriptor present) the descriptor follows the
    /// frame as SCM_RIGHTS; segmented responses require the negotiated
    /// capability.
    pub fn send_response(&mut self, response: &Response) -> Result<()> {
        let metadata_len = response.metadata.len() as u16;

        match self.params.version {
            Version::V1 => {
                let mut header = [0u8; 11];
                header[0] = response.status as u8;
                header[1..9].copy_from_slice(&response.content_len.to_be_bytes());
                header[9..11].copy_from_slice(&metadata_len.to_be_bytes());
                stream_write(&self.stream, &header)?;
                if !response.metadata.is_empty() {
                    stream_write(&self.stream, &response.metadata)?;
                }
                if response.status == Status::Ok {
                    if let Some(fd) = &response.fd {
                        fdpass::send_fd(self.stream.as_fd(), fd.as_fd(), b'X')?;
                    }
                }
            }
            Version::V2 => {
                if response.is_segmented() {
                    if !self.params.has_capability(CAP_SEGMENTED_DELIVERY) {
                        return Err(MapperError::Capability(
                            "peer lacks segmented delivery capability".into(),
                        ));
                    }

                    let mut header = [0u8; 10];
                    header[0] = MSG_SEGMENTED_RESPONSE;
                    header[1..5].copy_from_slice(&response.request_id.to_be_bytes());
                    header[5] = response.status as u8;
                    header[6..8].copy_from_slice(&(response.segments.len() as u16).to_be_bytes());
                    header[8..10].copy_from_slice(&metadata_len.to_be_bytes());
                    stream_write(&self.stream, &header)?;
                    if !response.metadata.is_empty() {
                        stream_write(&self.stream, &response.metadata)?;
                    }
                    segment::send_segments(&self.stream, &response.segments)?;
                } else {
                    let mut header = [0u8; 16];
                    header[0] = MSG_RESPONSE;
                    header[1..5].copy_from_slice(&response.request_id.to_be_bytes());
                    header[5] = response.status as u8;
                    header[6..14].copy_from_slice(&response.content_len.to_be_bytes());
                    header[14..16].copy_from_slice(&metadata_len.to_be_bytes());
                    stream_write(&self.stream, &header)?;
                    if !response.metadata.is_empty() {
                        stream_write(&self.stream, &response.metadata)?;
                    }
                    if response.status == Status::Ok {
                        if let Some(fd) = &response.fd {
                            fdpass::send_fd(self.stream.as_fd(), fd.as_fd(), b'X')?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Emit a status-bearing error frame with the message in the error
    /// TLV.
    pub fn send_error(&mut self, request_id: u32, status: Status, message: &str) -> Result<()> {
        let mut metadata = MetadataBuf::new();
        if !message.is_empty() {
            metadata.add_error(message);
        }
        let response = Response {
            metadata: metadata.into_bytes(),
            // Non-zero so V1 peers do not wait for a descriptor.
            content_len: 1,
            ..Response::new(request_id, status)
        };
        self.send_response(&response)
    }

    pub fn send_close_ack(&mut self, outstanding: u32) -> Result<()> {
        let mut ack = [0u8; 6];
        ack[0] = MSG_CLOSE_ACK;
        ack[1] = 0;
        ack[2..6].copy_from_slice(&outstanding.to_be_bytes());
        stream_write(&self.stream, &ack)
    }

    fn recv_uri(&mut self, uri_len: usize) -> Result<String> {
        if uri_len > MAX_URI_LEN {
            return Err(MapperError::UriTooLong(uri_len));
        }
        let mut uri = vec![0u8; uri_len];
        stream_read(&self.stream, &mut uri)?;
        String::from_utf8(uri)
            .map_err(|_| MapperError::InvalidRequest("URI is not valid UTF-8".into()))
    }
}
