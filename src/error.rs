use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the pomp API.
///
/// Each variant maps to a classic negative errno value through
/// [`Error::errno`], for embedders bridging back into C-style event loops.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument does not satisfy the contract of the call (wrong value
    /// type for a format specifier, unparsable argv string, mismatched
    /// wire tag while decoding, ...).
    #[error("invalid argument")]
    InvalidArgument,

    /// The format string contains an unknown or incomplete specifier.
    #[error("invalid format string")]
    InvalidFormat,

    /// The file descriptor is already registered in the event loop.
    #[error("file descriptor already registered")]
    AlreadyRegistered,

    /// The file descriptor is not registered in the event loop.
    #[error("file descriptor not registered")]
    NotFound,

    /// The message has been finished and no longer accepts writes.
    #[error("message is finished and read-only")]
    ReadOnly,

    /// No peer connection is active.
    #[error("not connected")]
    NotConnected,

    /// The wait elapsed without any event, timer expiry or wakeup.
    #[error("timed out")]
    TimedOut,

    /// The object is in use and cannot be reinitialized.
    #[error("busy")]
    Busy,

    /// The message exceeds the maximum frame size.
    #[error("message too large")]
    MessageTooLarge,

    /// Malformed wire data (bad magic, unknown tag, truncated body).
    #[error("protocol error")]
    Protocol,

    /// File descriptors can only travel over unix local sockets.
    #[error("fd passing not supported on this transport")]
    FdPassingNotSupported,

    /// The operation is not supported by the active backend.
    #[error("not supported by this backend")]
    NotSupported,

    /// The operation would block; retry at the next readiness.
    #[error("operation would block")]
    WouldBlock,

    /// Underlying system error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Negative errno rendition of the error, following the conventions of
    /// the original C API (`0` success, `-errno` failure).
    pub fn errno(&self) -> i32 {
        let e = match self {
            Error::InvalidArgument | Error::InvalidFormat => libc::EINVAL,
            Error::AlreadyRegistered => libc::EEXIST,
            Error::NotFound => libc::ENOENT,
            Error::ReadOnly => libc::EPERM,
            Error::NotConnected => libc::ENOTCONN,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Busy => libc::EBUSY,
            Error::MessageTooLarge => libc::EMSGSIZE,
            Error::Protocol => libc::EPROTO,
            Error::FdPassingNotSupported => libc::EOPNOTSUPP,
            Error::NotSupported => libc::ENOSYS,
            Error::WouldBlock => libc::EAGAIN,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        };
        -e
    }

    /// Raw OS error number when the error wraps one.
    pub(crate) fn raw_os(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::InvalidArgument.errno(), -libc::EINVAL);
        assert_eq!(Error::ReadOnly.errno(), -libc::EPERM);
        assert_eq!(Error::TimedOut.errno(), -libc::ETIMEDOUT);
        assert_eq!(Error::NotSupported.errno(), -libc::ENOSYS);
        let io = Error::from(io::Error::from_raw_os_error(libc::EPIPE));
        assert_eq!(io.errno(), -libc::EPIPE);
    }
}
