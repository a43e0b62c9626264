//! One-to-one SCTP sockets for the message-oriented control transport
//!
//! tokio has no SCTP support, so this wraps a nonblocking `socket2::Socket`
//! in an [`AsyncFd`] and does the message I/O with `sendmsg`/`recvmsg`.
//! Stream ids travel in `SCTP_SNDRCV` ancillary data; receiving them
//! requires subscribing to data-io events on the socket, which happens once
//! at construction.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// `SCTP_EVENTS` socket option (Linux uapi value)
const SCTP_EVENTS: libc::c_int = 11;

/// `SCTP_SNDRCV` ancillary data type (Linux uapi value)
const SCTP_SNDRCV: libc::c_int = 1;

/// `MSG_NOTIFICATION` flag on received SCTP notifications
const MSG_NOTIFICATION: libc::c_int = 0x8000;

/// `struct sctp_sndrcvinfo` from the kernel ABI
#[repr(C)]
#[derive(Clone, Copy)]
struct SctpSndRcvInfo {
    sinfo_stream: u16,
    sinfo_ssn: u16,
    sinfo_flags: u16,
    sinfo_ppid: u32,
    sinfo_context: u32,
    sinfo_timetolive: u32,
    sinfo_tsn: u32,
    sinfo_cumtsn: u32,
    sinfo_assoc_id: i32,
}

/// `struct sctp_event_subscribe`, classic eight-field prefix
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct SctpEventSubscribe {
    data_io_event: u8,
    association_event: u8,
    address_event: u8,
    send_failure_event: u8,
    peer_error_event: u8,
    shutdown_event: u8,
    partial_delivery_event: u8,
    adaptation_layer_event: u8,
}

/// Ancillary data buffer, aligned for `cmsghdr` access
#[repr(align(8))]
struct CmsgBuffer([u8; 64]);

/// Outcome of one `recvmsg` on an SCTP socket
struct RecvOutcome {
    len: usize,
    stream_id: u16,
    complete: bool,
    notification: bool,
}

/// Listening one-to-one SCTP socket
pub struct SctpListener {
    inner: AsyncFd<Socket>,
}

impl SctpListener {
    /// Bind and listen on `addr`
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::for_address(addr),
            Type::STREAM,
            Some(Protocol::from(libc::IPPROTO_SCTP)),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            inner: AsyncFd::with_interest(socket, Interest::READABLE)?,
        })
    }

    /// Locally bound address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sock_addr(self.inner.get_ref().local_addr()?)
    }

    /// Accept one association
    pub async fn accept(&self) -> io::Result<(SctpSocket, SocketAddr)> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().accept()) {
                Ok(Ok((socket, peer))) => {
                    return Ok((SctpSocket::new(socket)?, sock_addr(peer)?));
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for SctpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

/// Connected one-to-one SCTP socket with message semantics
#[derive(Debug)]
pub struct SctpSocket {
    inner: AsyncFd<Socket>,
}

impl SctpSocket {
    pub(crate) fn new(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        subscribe_recv_info(socket.as_raw_fd())?;
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    /// Kernel-reported protocol of the underlying socket
    pub fn protocol(&self) -> io::Result<Option<Protocol>> {
        self.inner.get_ref().protocol()
    }

    /// Locally bound address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sock_addr(self.inner.get_ref().local_addr()?)
    }

    /// Peer address
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sock_addr(self.inner.get_ref().peer_addr()?)
    }

    /// Receive one complete message into `buf`
    ///
    /// Returns the message length and the SCTP stream it arrived on; a zero
    /// length means the association was shut down. Notifications are
    /// swallowed. A message that does not fit `buf` is an error, one
    /// request per datagram being the contract on the control stream.
    pub async fn recv_message(&self, buf: &mut [u8]) -> io::Result<(usize, u16)> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| recv_sctp(inner.get_ref().as_raw_fd(), buf)) {
                Ok(Ok(out)) => {
                    if out.notification {
                        continue;
                    }
                    if out.len > 0 && !out.complete {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "SCTP message larger than receive buffer",
                        ));
                    }
                    return Ok((out.len, out.stream_id));
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Send one complete message on `stream_id`
    pub async fn send_message(&self, stream_id: u16, data: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| send_sctp(inner.get_ref().as_raw_fd(), stream_id, data)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for SctpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

fn sock_addr(addr: SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "non-IP socket address family")
    })
}

fn subscribe_recv_info(fd: RawFd) -> io::Result<()> {
    let events = SctpEventSubscribe {
        data_io_event: 1,
        ..Default::default()
    };

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_SCTP,
            SCTP_EVENTS,
            &events as *const _ as *const libc::c_void,
            mem::size_of::<SctpEventSubscribe>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn send_sctp(fd: RawFd, stream_id: u16, data: &[u8]) -> io::Result<usize> {
    let mut info: SctpSndRcvInfo = unsafe { mem::zeroed() };
    info.sinfo_stream = stream_id;
    let info_len = mem::size_of::<SctpSndRcvInfo>();

    let mut control = CmsgBuffer([0u8; 64]);
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(info_len as u32) } as usize;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::IPPROTO_SCTP;
        (*cmsg).cmsg_type = SCTP_SNDRCV;
        (*cmsg).cmsg_len = libc::CMSG_LEN(info_len as u32) as usize;
        std::ptr::copy_nonoverlapping(
            &info as *const SctpSndRcvInfo as *const u8,
            libc::CMSG_DATA(cmsg),
            info_len,
        );

        let n = libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

fn recv_sctp(fd: RawFd, buf: &mut [u8]) -> io::Result<RecvOutcome> {
    let mut control = CmsgBuffer([0u8; 64]);
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.0.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut stream_id = 0u16;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_SCTP && (*cmsg).cmsg_type == SCTP_SNDRCV {
                let mut info: SctpSndRcvInfo = mem::zeroed();
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    &mut info as *mut SctpSndRcvInfo as *mut u8,
                    mem::size_of::<SctpSndRcvInfo>(),
                );
                stream_id = info.sinfo_stream;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(RecvOutcome {
        len: n as usize,
        stream_id,
        complete: msg.msg_flags & libc::MSG_EOR != 0,
        notification: msg.msg_flags & MSG_NOTIFICATION != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sndrcvinfo_matches_kernel_abi() {
        // 32 bytes on every Linux target this compiles for
        assert_eq!(mem::size_of::<SctpSndRcvInfo>(), 32);
    }

    #[test]
    fn test_cmsg_buffer_fits_sndrcvinfo() {
        let needed = unsafe { libc::CMSG_SPACE(mem::size_of::<SctpSndRcvInfo>() as u32) } as usize;
        assert!(needed <= 64);
    }
}
