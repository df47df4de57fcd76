//! Growable byte buffer with an attached list of owned file descriptors.

use std::fmt;
use std::io;
use std::os::unix::io::{BorrowedFd, OwnedFd};

use crate::Result;

/// Byte storage backing a message, together with the file descriptors
/// referenced from inside the bytes (by index, see the `fd` wire tag).
///
/// The buffer owns its descriptors: they are duplicated on ingest and
/// closed when the buffer is dropped. A buffer that backs a queued
/// message is shared as `Rc<Buffer>` and never mutated again, so a
/// broadcast to N peers keeps a single copy of the bytes alive.
pub struct Buffer {
    data: Vec<u8>,
    fds: Vec<OwnedFd>,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer { data: Vec::new(), fds: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Buffer {
        Buffer { data: Vec::with_capacity(cap), fds: Vec::new() }
    }

    pub(crate) fn from_parts(data: Vec<u8>, fds: Vec<OwnedFd>) -> Buffer {
        Buffer { data, fds }
    }

    /// Make room for at least `additional` more bytes. Growth is
    /// geometric (`Vec` doubles), keeping appends amortized O(1).
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Duplicate `fd` into the buffer's descriptor list and return its
    /// index, which is what the wire encoding of an fd argument carries.
    pub fn append_fd(&mut self, fd: BorrowedFd<'_>) -> Result<u32> {
        let owned = fd.try_clone_to_owned()?;
        self.fds.push(owned);
        Ok((self.fds.len() - 1) as u32)
    }

    /// Patch 4 little-endian bytes in place; used to stamp the frame
    /// size into an already-written header.
    pub(crate) fn write_u32_at(&mut self, off: usize, v: u32) {
        self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Deep copy: bytes are cloned and every descriptor is duplicated,
    /// so the clone stays valid after the original is dropped.
    pub fn try_clone(&self) -> Result<Buffer> {
        let fds = self
            .fds
            .iter()
            .map(|fd| fd.try_clone())
            .collect::<io::Result<Vec<OwnedFd>>>()?;
        Ok(Buffer { data: self.data.clone(), fds })
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("fds", &self.fds.len())
            .finish()
    }
}

/// The encoder drives the buffer through `byteorder`'s `WriteBytesExt`,
/// which needs an `io::Write` sink.
impl io::Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::io::{AsFd, AsRawFd};

    #[test]
    fn append_and_patch() {
        let mut b = Buffer::new();
        b.append(&[1, 2, 3, 4]);
        b.append(&[5]);
        assert_eq!(b.len(), 5);
        b.write_u32_at(0, 0xAABBCCDD);
        assert_eq!(b.data(), &[0xDD, 0xCC, 0xBB, 0xAA, 5]);
    }

    #[test]
    fn reserve_keeps_contents() {
        let mut b = Buffer::with_capacity(4);
        b.append(b"abcd");
        b.reserve(1024);
        assert_eq!(b.data(), b"abcd");
    }

    #[test]
    fn io_write_appends() {
        let mut b = Buffer::new();
        b.write_all(b"xy").unwrap();
        assert_eq!(b.data(), b"xy");
    }

    #[test]
    fn clone_duplicates_fds() {
        let file = tempfile::tempfile().unwrap();
        let mut b = Buffer::new();
        let idx = b.append_fd(file.as_fd()).unwrap();
        assert_eq!(idx, 0);
        // ingest duplicated the descriptor
        assert_ne!(b.fds()[0].as_raw_fd(), file.as_raw_fd());

        let c = b.try_clone().unwrap();
        assert_eq!(c.fds().len(), 1);
        assert_ne!(c.fds()[0].as_raw_fd(), b.fds()[0].as_raw_fd());
        // both descriptors are alive
        for fd in [b.fds()[0].as_raw_fd(), c.fds()[0].as_raw_fd()] {
            assert_ne!(unsafe { libc::fcntl(fd, libc::F_GETFD) }, -1);
        }
    }
}
