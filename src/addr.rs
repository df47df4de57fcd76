//! Socket address strings.
//!
//! The textual grammar has four forms:
//!
//! - `inet:<host>:<port>` — numeric IPv4
//! - `inet6:<host>:<port>` — numeric IPv6
//! - `unix:<path>` — filesystem unix socket
//! - `unix:@<name>` — Linux abstract namespace
//!
//! Hosts are numeric only; name resolution belongs to the caller.

use std::fmt;
use std::mem;
use std::net::{SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// A unix local socket name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixAddr {
    /// Filesystem pathname, absolute or relative.
    Path(PathBuf),
    /// Abstract namespace name (no filesystem presence, Linux only). The
    /// leading NUL is implied and not stored.
    Abstract(Vec<u8>),
}

/// A parsed socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
    Unix(UnixAddr),
}

impl Addr {
    pub fn is_unix(&self) -> bool {
        matches!(self, Addr::Unix(_))
    }

    pub(crate) fn family(&self) -> libc::c_int {
        match self {
            Addr::Inet(_) => libc::AF_INET,
            Addr::Inet6(_) => libc::AF_INET6,
            Addr::Unix(_) => libc::AF_UNIX,
        }
    }

    /// Convert to the raw form the socket syscalls take.
    pub(crate) fn to_raw(&self) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        match self {
            Addr::Inet(sa) => {
                let sin = &mut ss as *mut _ as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = sa.port().to_be();
                    (*sin).sin_addr = libc::in_addr {
                        s_addr: u32::from_ne_bytes(sa.ip().octets()),
                    };
                }
                Ok((ss, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
            }
            Addr::Inet6(sa) => {
                let sin6 = &mut ss as *mut _ as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = sa.port().to_be();
                    (*sin6).sin6_addr.s6_addr = sa.ip().octets();
                    (*sin6).sin6_flowinfo = sa.flowinfo();
                    (*sin6).sin6_scope_id = sa.scope_id();
                }
                Ok((ss, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t))
            }
            Addr::Unix(name) => {
                let sun = &mut ss as *mut _ as *mut libc::sockaddr_un;
                let path_cap = unsafe { (*sun).sun_path.len() };
                let off = sun_path_offset();
                let len = unsafe {
                    (*sun).sun_family = libc::AF_UNIX as libc::sa_family_t;
                    match name {
                        UnixAddr::Path(p) => {
                            let bytes = p.as_os_str().as_bytes();
                            // room for the terminating NUL
                            if bytes.is_empty() || bytes.len() >= path_cap {
                                return Err(Error::InvalidArgument);
                            }
                            for (dst, src) in (*sun).sun_path.iter_mut().zip(bytes) {
                                *dst = *src as libc::c_char;
                            }
                            off + bytes.len() + 1
                        }
                        UnixAddr::Abstract(name) => {
                            // leading NUL, no terminator
                            if name.len() + 1 > path_cap {
                                return Err(Error::InvalidArgument);
                            }
                            for (dst, src) in (&mut (*sun).sun_path)[1..].iter_mut().zip(name) {
                                *dst = *src as libc::c_char;
                            }
                            off + 1 + name.len()
                        }
                    }
                };
                Ok((ss, len as libc::socklen_t))
            }
        }
    }

    /// Convert back from the raw form returned by
    /// `getsockname`/`getpeername`/`recvmsg`.
    pub(crate) fn from_raw(ss: &libc::sockaddr_storage, len: libc::socklen_t) -> Result<Addr> {
        match ss.ss_family as libc::c_int {
            libc::AF_INET => {
                if (len as usize) < mem::size_of::<libc::sockaddr_in>() {
                    return Err(Error::InvalidArgument);
                }
                let sin = unsafe { &*(ss as *const _ as *const libc::sockaddr_in) };
                let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Ok(Addr::Inet(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                if (len as usize) < mem::size_of::<libc::sockaddr_in6>() {
                    return Err(Error::InvalidArgument);
                }
                let sin6 = unsafe { &*(ss as *const _ as *const libc::sockaddr_in6) };
                let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(Addr::Inet6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            libc::AF_UNIX => {
                let sun = unsafe { &*(ss as *const _ as *const libc::sockaddr_un) };
                let off = sun_path_offset();
                let path_len = (len as usize)
                    .saturating_sub(off)
                    .min(sun.sun_path.len());
                if path_len == 0 {
                    // unnamed (socketpair or unbound)
                    return Ok(Addr::Unix(UnixAddr::Path(PathBuf::new())));
                }
                let bytes: Vec<u8> = sun.sun_path[..path_len]
                    .iter()
                    .map(|c| *c as u8)
                    .collect();
                if bytes[0] == 0 {
                    Ok(Addr::Unix(UnixAddr::Abstract(bytes[1..].to_vec())))
                } else {
                    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                    let os = std::ffi::OsStr::from_bytes(&bytes[..end]);
                    Ok(Addr::Unix(UnixAddr::Path(PathBuf::from(os))))
                }
            }
            _ => Err(Error::InvalidArgument),
        }
    }
}

impl FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Addr> {
        if let Some(rest) = s.strip_prefix("inet:") {
            let (host, port) = rest.rsplit_once(':').ok_or(Error::InvalidArgument)?;
            let ip = host.parse().map_err(|_| Error::InvalidArgument)?;
            let port = port.parse().map_err(|_| Error::InvalidArgument)?;
            Ok(Addr::Inet(SocketAddrV4::new(ip, port)))
        } else if let Some(rest) = s.strip_prefix("inet6:") {
            let (host, port) = rest.rsplit_once(':').ok_or(Error::InvalidArgument)?;
            let ip = host.parse().map_err(|_| Error::InvalidArgument)?;
            let port = port.parse().map_err(|_| Error::InvalidArgument)?;
            Ok(Addr::Inet6(SocketAddrV6::new(ip, port, 0, 0)))
        } else if let Some(rest) = s.strip_prefix("unix:") {
            if let Some(name) = rest.strip_prefix('@') {
                Ok(Addr::Unix(UnixAddr::Abstract(name.as_bytes().to_vec())))
            } else if rest.is_empty() {
                Err(Error::InvalidArgument)
            } else {
                Ok(Addr::Unix(UnixAddr::Path(PathBuf::from(rest))))
            }
        } else {
            Err(Error::InvalidArgument)
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Inet(sa) => write!(f, "inet:{}:{}", sa.ip(), sa.port()),
            Addr::Inet6(sa) => write!(f, "inet6:{}:{}", sa.ip(), sa.port()),
            Addr::Unix(UnixAddr::Path(p)) => write!(f, "unix:{}", p.display()),
            Addr::Unix(UnixAddr::Abstract(name)) => {
                write!(f, "unix:@{}", String::from_utf8_lossy(name))
            }
        }
    }
}

fn sun_path_offset() -> usize {
    let un: libc::sockaddr_un = unsafe { mem::zeroed() };
    let base = &un as *const _ as usize;
    let path = &un.sun_path as *const _ as usize;
    path - base
}
