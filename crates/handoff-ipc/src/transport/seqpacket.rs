//! `SOCK_SEQPACKET` Unix socket transport.
//!
//! Each message is one datagram; handles ride along as `SCM_RIGHTS`
//! ancillary data. Sequenced-packet sockets preserve message boundaries and
//! order, and report peer shutdown as a zero-length read.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag,
    SockType, UnixAddr,
};
use tracing::{debug, warn};

use super::Transport;
use crate::error::TransportError;
use crate::wire::{Message, MAX_SLOTS};

/// Largest datagram accepted; a full setup is far below this.
const MAX_MESSAGE_BYTES: usize = 4096;

#[derive(Debug)]
pub struct SeqPacketTransport {
    fd: Option<OwnedFd>,
}

impl SeqPacketTransport {
    /// Connected pair in one process; both ends are close-on-exec.
    pub fn pair() -> Result<(Self, Self), TransportError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        debug!("Created seqpacket pair: {} <-> {}", a.as_raw_fd(), b.as_raw_fd());
        Ok((Self::from_fd(a), Self::from_fd(b)))
    }

    /// Adopt an already-connected seqpacket socket, e.g. one inherited from a parent.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    fn socket(&self) -> Result<BorrowedFd<'_>, TransportError> {
        self.fd.as_ref().map(|fd| fd.as_fd()).ok_or(TransportError::Closed)
    }
}

fn peer_gone(errno: Errno) -> TransportError {
    match errno {
        Errno::EPIPE | Errno::ECONNRESET | Errno::ENOTCONN => TransportError::PeerClosed,
        other => TransportError::Io(other),
    }
}

impl Transport for SeqPacketTransport {
    fn send(&mut self, msg: Message) -> Result<(), TransportError> {
        let socket = self.socket()?;
        if msg.handles.len() > MAX_SLOTS {
            return Err(TransportError::TooManyHandles {
                count: msg.handles.len(),
                limit: MAX_SLOTS,
            });
        }

        let raw_fds: Vec<RawFd> = msg.handles.iter().map(|fd| fd.as_raw_fd()).collect();
        let iov = [IoSlice::new(&msg.bytes)];
        let cmsgs = [ControlMessage::ScmRights(&raw_fds)];
        let cmsgs: &[ControlMessage<'_>] = if raw_fds.is_empty() { &[] } else { &cmsgs };

        loop {
            match sendmsg::<()>(socket.as_raw_fd(), &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(peer_gone(e)),
            }
        }

        // The kernel duplicated the handles into the peer; our copies close here
        Ok(())
    }

    fn receive(&mut self) -> Result<Message, TransportError> {
        let socket = self.socket()?;
        let mut buf = vec![0u8; MAX_MESSAGE_BYTES];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_SLOTS]);

        let (len, flags, handles) = loop {
            let mut iov = [IoSliceMut::new(&mut buf)];
            match recvmsg::<UnixAddr>(
                socket.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(resp) => {
                    let mut handles = Vec::new();
                    for cmsg in resp.cmsgs()? {
                        match cmsg {
                            ControlMessageOwned::ScmRights(fds) => {
                                handles.extend(fds.into_iter().map(|fd| {
                                    // SAFETY: fd was just received, is valid, and is recorded nowhere else
                                    unsafe { OwnedFd::from_raw_fd(fd) }
                                }));
                            }
                            other => warn!("Unexpected control message: {:?}, ignoring", other),
                        }
                    }
                    break (resp.bytes, resp.flags, handles);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(peer_gone(e)),
            }
        };

        if flags.intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC) {
            warn!("Dropping truncated message ({} bytes, {} handles)", len, handles.len());
            return Err(TransportError::Truncated);
        }
        if len == 0 && handles.is_empty() {
            return Err(TransportError::PeerClosed);
        }

        buf.truncate(len);
        Ok(Message::new(buf, handles))
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            debug!("Closing seqpacket transport fd {}", fd.as_raw_fd());
        }
    }

    fn is_closed(&self) -> bool {
        self.fd.is_none()
    }
}
