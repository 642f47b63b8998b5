//! File descriptor passing over Unix-domain stream sockets.
//!
//! One kernel descriptor travels as an `SCM_RIGHTS` ancillary control
//! message; the in-band payload is a single tag byte so the message is
//! never empty. On send the kernel duplicates the descriptor, so the
//! sender keeps ownership of its copy; the receiver owns the duplicate.
//!
//! # Safety
//!
//! The only unsafe operation here is adopting the received raw descriptor
//! into an [`OwnedFd`]. The kernel guarantees the descriptor is freshly
//! installed into this process's table by `recvmsg`, so ownership is
//! uncontested at that point.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::error::{MapperError, Result};

/// Send `fd` plus a one-byte `tag` over the connected stream socket `sock`.
///
/// The caller retains ownership of `fd`; the kernel delivers a duplicate
/// to the peer.
pub fn send_fd(sock: BorrowedFd<'_>, fd: BorrowedFd<'_>, tag: u8) -> Result<()> {
    let payload = [tag];
    let iov = [IoSlice::new(&payload)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    Ok(())
}

/// Receive one descriptor plus its tag byte from `sock`.
///
/// The returned [`OwnedFd`] is owned by the caller and closed on drop.
/// Fails if the peer closed the stream or no `SCM_RIGHTS` control message
/// was attached.
pub fn recv_fd(sock: BorrowedFd<'_>) -> Result<(OwnedFd, u8)> {
    let mut payload = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut payload)];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )?;

    if msg.bytes == 0 {
        return Err(MapperError::Protocol(
            "peer closed while awaiting descriptor".into(),
        ));
    }

    let mut received: Option<RawFd> = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            received = fds.first().copied();
        }
    }

    match received {
        // SAFETY: the descriptor was just installed by recvmsg and is not
        // referenced anywhere else in this process.
        Some(raw) if raw >= 0 => Ok((unsafe { OwnedFd::from_raw_fd(raw) }, payload[0])),
        _ => Err(MapperError::Protocol(
            "control message missing SCM_RIGHTS descriptor".into(),
        )),
    }
}
