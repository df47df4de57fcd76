//! Messages and the on-wire frame header.

use std::mem;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};

use crate::buffer::Buffer;
use crate::codec::{Decoder, Encoder, Value};
use crate::{Error, Result};

/// Frame magic, "POMP" in little-endian byte order.
pub const MAGIC: u32 = 0x504F_4D50;

/// Bytes of header preceding the TLV payload: magic, msgid, size.
pub const HEADER_SIZE: usize = 12;

/// Frames larger than this are refused on both the send and receive
/// paths; a peer advertising a bigger size is disconnected.
pub const MAX_MSG_SIZE: u32 = 1 << 24;

/// Parsed frame header. `size` covers the header itself plus the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub msgid: u32,
    pub size: u32,
}

impl Header {
    /// Decode the first [`HEADER_SIZE`] bytes of a frame. The caller
    /// checks `size` against [`MAX_MSG_SIZE`]; this only validates the
    /// magic and the minimum size invariant.
    pub fn parse(b: &[u8]) -> Result<Header> {
        if b.len() < HEADER_SIZE {
            return Err(Error::Protocol);
        }
        if LittleEndian::read_u32(&b[0..4]) != MAGIC {
            return Err(Error::Protocol);
        }
        let msgid = LittleEndian::read_u32(&b[4..8]);
        let size = LittleEndian::read_u32(&b[8..12]);
        if (size as usize) < HEADER_SIZE {
            return Err(Error::Protocol);
        }
        Ok(Header { msgid, size })
    }
}

enum MsgBuf {
    /// `new()`-ed or `clear()`-ed, no storage yet.
    Empty,
    /// Between `init` and `finish`: header placeholder written, encoder
    /// appends TLV arguments.
    Building(Buffer),
    /// Immutable; shared with send queues by reference count.
    Finished(Rc<Buffer>),
}

/// A message: 32-bit identifier plus TLV-encoded payload.
///
/// The lifecycle follows the wire format: [`init`](Msg::init) stamps a
/// header placeholder, [`Encoder`] writes arguments, and
/// [`finish`](Msg::finish) patches the frame size and freezes the bytes.
/// [`write`](Msg::write) is the one-shot shorthand for all three.
pub struct Msg {
    id: u32,
    buf: MsgBuf,
}

impl Msg {
    pub fn new() -> Msg {
        Msg { id: 0, buf: MsgBuf::Empty }
    }

    /// Start encoding a message with the given id. Fails with
    /// [`Error::Busy`] until a previous encoding is [`clear`](Msg::clear)-ed.
    pub fn init(&mut self, msgid: u32) -> Result<()> {
        if !matches!(self.buf, MsgBuf::Empty) {
            return Err(Error::Busy);
        }
        let mut b = Buffer::with_capacity(32);
        b.append(&MAGIC.to_le_bytes());
        b.append(&msgid.to_le_bytes());
        b.append(&0u32.to_le_bytes());
        self.id = msgid;
        self.buf = MsgBuf::Building(b);
        Ok(())
    }

    /// Stamp the frame size into the header and freeze the message. Any
    /// further write fails with [`Error::ReadOnly`].
    pub fn finish(&mut self) -> Result<()> {
        match &self.buf {
            MsgBuf::Building(b) => {
                if b.len() > MAX_MSG_SIZE as usize {
                    return Err(Error::MessageTooLarge);
                }
            }
            MsgBuf::Finished(_) => return Err(Error::ReadOnly),
            MsgBuf::Empty => return Err(Error::InvalidArgument),
        }
        let MsgBuf::Building(mut b) = mem::replace(&mut self.buf, MsgBuf::Empty) else {
            unreachable!()
        };
        let size = b.len() as u32;
        b.write_u32_at(8, size);
        self.buf = MsgBuf::Finished(Rc::new(b));
        Ok(())
    }

    /// Drop the payload so the message can be reused with `init`. Queued
    /// copies of a previously finished payload are unaffected: they hold
    /// their own reference to the bytes.
    pub fn clear(&mut self) {
        self.id = 0;
        self.buf = MsgBuf::Empty;
    }

    /// One-shot convenience: `init` + format-driven encode + `finish`.
    pub fn write(&mut self, msgid: u32, fmt: &str, args: &[Value<'_>]) -> Result<()> {
        self.init(msgid)?;
        let r = Encoder::new(self).and_then(|mut enc| enc.write(fmt, args));
        if let Err(e) = r {
            self.clear();
            return Err(e);
        }
        self.finish()
    }

    /// Deep copy: the bytes are cloned and every attached descriptor is
    /// duplicated, so the copy survives the original.
    pub fn try_clone(&self) -> Result<Msg> {
        let buf = match &self.buf {
            MsgBuf::Empty => MsgBuf::Empty,
            MsgBuf::Building(b) => MsgBuf::Building(b.try_clone()?),
            MsgBuf::Finished(b) => MsgBuf::Finished(Rc::new(b.try_clone()?)),
        };
        Ok(Msg { id: self.id, buf })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.buf, MsgBuf::Finished(_))
    }

    pub(crate) fn is_building(&self) -> bool {
        matches!(self.buf, MsgBuf::Building(_))
    }

    pub(crate) fn building_buf_mut(&mut self) -> &mut Buffer {
        match &mut self.buf {
            MsgBuf::Building(b) => b,
            _ => unreachable!("encoder only exists for a building message"),
        }
    }

    /// The finished frame's backing buffer, shared with send queues.
    pub(crate) fn shared_buf(&self) -> Result<&Rc<Buffer>> {
        match &self.buf {
            MsgBuf::Finished(b) => Ok(b),
            _ => Err(Error::InvalidArgument),
        }
    }

    /// Build a message from a complete frame received off the wire,
    /// with any ancillary descriptors already attached to `buf`.
    pub(crate) fn from_wire(buf: Buffer) -> Result<Msg> {
        let hdr = Header::parse(buf.data())?;
        if buf.len() != hdr.size as usize {
            return Err(Error::Protocol);
        }
        Ok(Msg { id: hdr.msgid, buf: MsgBuf::Finished(Rc::new(buf)) })
    }

    /// Complete frame bytes (header included) of a finished message.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        Ok(self.shared_buf()?.data())
    }

    pub fn decoder(&self) -> Result<Decoder<'_>> {
        let b = self.shared_buf()?;
        Ok(Decoder::new(self.id, &b.data()[HEADER_SIZE..], b.fds()))
    }

    /// Format-driven read of the whole argument list.
    pub fn read(&self, fmt: &str) -> Result<Vec<Value<'_>>> {
        self.decoder()?.read(fmt)
    }

    /// Human-readable rendering of id and arguments.
    pub fn dump(&self) -> Result<String> {
        self.decoder()?.dump()
    }

    /// Like [`dump`](Msg::dump) but capped at `max` bytes with a `...`
    /// marker when truncated.
    pub fn dump_truncated(&self, max: usize) -> Result<String> {
        self.decoder()?.dump_truncated(max)
    }
}

impl Default for Msg {
    fn default() -> Msg {
        Msg::new()
    }
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.buf {
            MsgBuf::Empty => write!(f, "Msg(empty)"),
            MsgBuf::Building(_) => write!(f, "Msg(id={}, building)", self.id),
            MsgBuf::Finished(b) => write!(f, "Msg(id={}, {} bytes)", self.id, b.len()),
        }
    }
}
