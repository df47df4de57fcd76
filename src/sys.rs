//! Thin wrappers over the socket and descriptor syscalls.
//!
//! All the `unsafe` FFI of the crate lives here: nonblocking socket
//! setup, `sendmsg`/`recvmsg` with `SCM_RIGHTS` ancillary descriptors,
//! socket options, and the wakeup channel primitives. Everything is
//! non-blocking; callers handle `EAGAIN` at the next readiness.

use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::addr::Addr;
use crate::{Error, Result};

/// Kernel cap on descriptors in one `SCM_RIGHTS` control message.
pub(crate) const SCM_MAX_FD: usize = 253;

/// Control buffer large enough for `SCM_MAX_FD` descriptors, kept as
/// `u64`s so it is aligned for `cmsghdr`.
const CMSG_BUF_U64: usize = 144;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Create a nonblocking, close-on-exec socket for `addr`.
pub(crate) fn socket(addr: &Addr, dgram: bool) -> Result<OwnedFd> {
    let ty = if dgram { libc::SOCK_DGRAM } else { libc::SOCK_STREAM };
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ty = ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    let raw = cvt(unsafe { libc::socket(addr.family(), ty, 0) })?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    set_nonblock_cloexec(raw)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    set_nosigpipe(raw)?;
    Ok(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn set_nonblock_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        let fl = cvt(libc::fcntl(fd, libc::F_GETFL))?;
        cvt(libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK))?;
        let fl = cvt(libc::fcntl(fd, libc::F_GETFD))?;
        cvt(libc::fcntl(fd, libc::F_SETFD, fl | libc::FD_CLOEXEC))?;
    }
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn set_nosigpipe(fd: RawFd) -> Result<()> {
    let on: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub(crate) fn set_reuseaddr(fd: RawFd) -> Result<()> {
    let on: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub(crate) fn bind(fd: RawFd, addr: &Addr) -> Result<()> {
    let (ss, len) = addr.to_raw()?;
    cvt(unsafe { libc::bind(fd, &ss as *const _ as *const libc::sockaddr, len) })?;
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> Result<()> {
    cvt(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

/// Nonblocking connect. The caller distinguishes `EINPROGRESS` from a
/// hard failure, so this surfaces the raw `io::Error`.
pub(crate) fn connect(fd: RawFd, addr: &Addr) -> Result<io::Result<()>> {
    let (ss, len) = addr.to_raw()?;
    let ret = unsafe { libc::connect(fd, &ss as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        Ok(Err(io::Error::last_os_error()))
    } else {
        Ok(Ok(()))
    }
}

/// Accept one pending connection; `Ok(None)` when the backlog is drained.
pub(crate) fn accept(fd: RawFd) -> Result<Option<(OwnedFd, Addr)>> {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    loop {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let ret = unsafe {
            libc::accept4(
                fd,
                &mut ss as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let ret = unsafe { libc::accept(fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(None),
                _ => return Err(err.into()),
            }
        }
        let conn = unsafe { OwnedFd::from_raw_fd(ret) };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        set_nonblock_cloexec(ret)?;
        let peer = Addr::from_raw(&ss, len)?;
        return Ok(Some((conn, peer)));
    }
}

pub(crate) fn local_addr(fd: RawFd) -> Result<Addr> {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Addr::from_raw(&ss, len)
}

pub(crate) fn peer_addr(fd: RawFd) -> Result<Addr> {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { libc::getpeername(fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Addr::from_raw(&ss, len)
}

/// Pending asynchronous connect result (`SO_ERROR`), 0 when established.
pub(crate) fn socket_error(fd: RawFd) -> Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(err)
}

/// Credentials of the unix stream peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn peer_cred(fd: RawFd) -> Option<PeerCred> {
    let mut cred: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return None;
    }
    Some(PeerCred { pid: cred.pid, uid: cred.uid, gid: cred.gid })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn peer_cred(_fd: RawFd) -> Option<PeerCred> {
    None
}

/// `sendmsg` carrying `bytes` and, when non-empty, `fds` as a single
/// `SCM_RIGHTS` control message. `dest` is set for datagram sends.
pub(crate) fn send_with_fds(
    sock: RawFd,
    bytes: &[u8],
    fds: &[RawFd],
    dest: Option<&Addr>,
) -> Result<usize> {
    if fds.len() > SCM_MAX_FD {
        return Err(Error::InvalidArgument);
    }
    let raw_dest = match dest {
        Some(addr) => Some(addr.to_raw()?),
        None => None,
    };
    unsafe {
        let mut iov = libc::iovec {
            // sendmsg never writes through the buffer; the cast is the
            // shape of the C API.
            iov_base: bytes.as_ptr() as *const _ as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        if let Some((ss, sl)) = raw_dest.as_ref() {
            msg.msg_name = ss as *const _ as *mut libc::c_void;
            msg.msg_namelen = *sl;
        }

        let mut cmsg_buf = [0u64; CMSG_BUF_U64];
        if !fds.is_empty() {
            let fd_len = fds.len() * mem::size_of::<RawFd>();
            let space = libc::CMSG_SPACE(fd_len as u32) as usize;
            debug_assert!(space <= cmsg_buf.len() * 8);
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = space as _;
            let hdr = libc::CMSG_FIRSTHDR(&msg);
            (*hdr).cmsg_level = libc::SOL_SOCKET;
            (*hdr).cmsg_type = libc::SCM_RIGHTS;
            (*hdr).cmsg_len = libc::CMSG_LEN(fd_len as u32) as _;
            let data = libc::CMSG_DATA(hdr) as *mut RawFd;
            for (i, fd) in fds.iter().enumerate() {
                ptr::write_unaligned(data.add(i), *fd);
            }
        }

        let n = libc::sendmsg(sock, &msg, SEND_FLAGS);
        if n < 0 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(n as usize)
        }
    }
}

/// Result of one `recvmsg`: byte count, ancillary descriptors in arrival
/// order (ownership taken), and the sender address when requested.
pub(crate) struct RecvResult {
    pub n: usize,
    pub fds: Vec<OwnedFd>,
    pub from: Option<Addr>,
}

/// `recvmsg` collecting any `SCM_RIGHTS` payload. Descriptors handed over
/// by the kernel are wrapped in `OwnedFd` immediately so an early return
/// cannot leak them.
pub(crate) fn recv_with_fds(sock: RawFd, buf: &mut [u8], want_addr: bool) -> io::Result<RecvResult> {
    unsafe {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        let mut ss: libc::sockaddr_storage = mem::zeroed();
        if want_addr {
            msg.msg_name = &mut ss as *mut _ as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        }
        let mut cmsg_buf = [0u64; CMSG_BUF_U64];
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = (cmsg_buf.len() * 8) as _;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let flags = libc::MSG_CMSG_CLOEXEC;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let flags = 0;
        let n = libc::recvmsg(sock, &mut msg, flags);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        // Walk the ancillary data and take ownership of every received
        // descriptor.
        let mut fds = Vec::new();
        let mut hdr = libc::CMSG_FIRSTHDR(&msg);
        while !hdr.is_null() {
            if (*hdr).cmsg_level == libc::SOL_SOCKET && (*hdr).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(hdr);
                let data_off = (data as usize).wrapping_sub(hdr as usize);
                let byte_count = ((*hdr).cmsg_len as usize).saturating_sub(data_off);
                let count = byte_count / mem::size_of::<RawFd>();
                for i in 0..count {
                    let raw = ptr::read_unaligned((data as *const RawFd).add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            hdr = libc::CMSG_NXTHDR(&msg, hdr);
        }

        let from = if want_addr && msg.msg_namelen > 0 {
            Addr::from_raw(&ss, msg.msg_namelen).ok()
        } else {
            None
        };
        Ok(RecvResult { n: n as usize, fds, from })
    }
}

/// Create the wakeup channel: `(read_side, write_side)`. On Linux this is
/// a single eventfd duplicated for the writer; elsewhere a nonblocking
/// pipe. The writer side only ever sees a single `write` call, which is
/// async-signal-safe.
pub(crate) fn wake_pair() -> Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let raw = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        let rx = unsafe { OwnedFd::from_raw_fd(raw) };
        let tx = rx.try_clone().map_err(Error::from)?;
        Ok((rx, tx))
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let mut fds = [0 as RawFd; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        let rx = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let tx = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblock_cloexec(fds[0])?;
        set_nonblock_cloexec(fds[1])?;
        Ok((rx, tx))
    }
}

/// Post a wakeup. A full pipe or saturated eventfd counter means a wakeup
/// is already pending, so errors are deliberately ignored.
pub(crate) fn wake_signal(fd: RawFd) {
    let one: u64 = 1;
    unsafe {
        let _ = libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
    }
}

/// Drain a readable descriptor completely (wakeup channel, timerfd).
pub(crate) fn drain(fd: RawFd) {
    let mut scratch = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len()) };
        if n <= 0 {
            break;
        }
        if (n as usize) < scratch.len() {
            break;
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn timerfd_create() -> Result<OwnedFd> {
    let raw = cvt(unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn timerfd_settime(
    fd: RawFd,
    delay: std::time::Duration,
    period: Option<std::time::Duration>,
) -> Result<()> {
    fn to_timespec(d: std::time::Duration) -> libc::timespec {
        libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        }
    }
    // a zero it_value disarms; a just-expired one-shot wants 1ns instead
    let mut value = to_timespec(delay);
    if !delay.is_zero() || period.is_some() {
        if value.tv_sec == 0 && value.tv_nsec == 0 {
            value.tv_nsec = 1;
        }
    }
    let spec = libc::itimerspec {
        it_interval: period.map(to_timespec).unwrap_or(libc::timespec { tv_sec: 0, tv_nsec: 0 }),
        it_value: value,
    };
    cvt(unsafe { libc::timerfd_settime(fd, 0, &spec, ptr::null_mut()) })?;
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn timerfd_disarm(fd: RawFd) -> Result<()> {
    let spec: libc::itimerspec = unsafe { mem::zeroed() };
    cvt(unsafe { libc::timerfd_settime(fd, 0, &spec, ptr::null_mut()) })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Seek as _, Write as _};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn fds_travel_over_a_stream_pair() {
        let (l, r) = UnixStream::pair().expect("create UnixStream pair");
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"ancillary").unwrap();
        file.rewind().unwrap();

        let sent = send_with_fds(l.as_raw_fd(), b"payload", &[file.as_raw_fd()], None)
            .expect("send should succeed");
        assert_eq!(sent, 7);

        let mut buf = [0u8; 32];
        let res = recv_with_fds(r.as_raw_fd(), &mut buf, false).expect("recv should succeed");
        assert_eq!(res.n, 7);
        assert_eq!(&buf[..7], b"payload");
        assert_eq!(res.fds.len(), 1);
        assert_ne!(res.fds[0].as_raw_fd(), file.as_raw_fd());

        let mut received = std::fs::File::from(res.fds.into_iter().next().unwrap());
        let mut s = String::new();
        received.read_to_string(&mut s).unwrap();
        assert_eq!(s, "ancillary");
    }

    #[test]
    fn sending_junk_fd_fails() {
        let (l, _r) = UnixStream::pair().unwrap();
        assert!(send_with_fds(l.as_raw_fd(), b"x", &[i32::MAX], None).is_err());
    }

    #[test]
    fn wake_channel_coalesces() {
        let (rx, tx) = wake_pair().unwrap();
        for _ in 0..100 {
            wake_signal(tx.as_raw_fd());
        }
        drain(rx.as_raw_fd());
        // fully drained: next read would block
        let mut b = [0u8; 16];
        let n = unsafe { libc::read(rx.as_raw_fd(), b.as_mut_ptr() as *mut libc::c_void, 16) };
        assert_eq!(n, -1);
        assert_eq!(
            io::Error::last_os_error().raw_os_error(),
            Some(libc::EAGAIN)
        );
    }
}
