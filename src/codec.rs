//! TLV encoding and decoding of message payloads.
//!
//! Every argument is written as a one-byte tag followed by a typed body;
//! integers and floats are little-endian, strings carry a `u32` length
//! that includes their trailing NUL, buffers carry a `u32` length, and
//! file descriptors are written as an index into the message buffer's
//! descriptor list (the descriptors themselves travel as ancillary data).

use std::fmt::Write as _;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::buffer::Buffer;
use crate::format::{self, Spec};
use crate::message::Msg;
use crate::sys;
use crate::{Error, Result};

/// Wire tag of a TLV argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    I8 = 0x01,
    U8 = 0x02,
    I16 = 0x03,
    U16 = 0x04,
    I32 = 0x05,
    U32 = 0x06,
    I64 = 0x07,
    U64 = 0x08,
    Str = 0x09,
    Buf = 0x0A,
    F32 = 0x0B,
    F64 = 0x0C,
    Fd = 0x0D,
}

impl Tag {
    pub fn from_u8(v: u8) -> Option<Tag> {
        Some(match v {
            0x01 => Tag::I8,
            0x02 => Tag::U8,
            0x03 => Tag::I16,
            0x04 => Tag::U16,
            0x05 => Tag::I32,
            0x06 => Tag::U32,
            0x07 => Tag::I64,
            0x08 => Tag::U64,
            0x09 => Tag::Str,
            0x0A => Tag::Buf,
            0x0B => Tag::F32,
            0x0C => Tag::F64,
            0x0D => Tag::Fd,
            _ => return None,
        })
    }
}

/// A typed message argument, as accepted by the format-driven writers and
/// produced by the format-driven reader.
#[derive(Debug, Clone, Copy)]
pub enum Value<'a> {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(&'a str),
    Buf(&'a [u8]),
    Fd(BorrowedFd<'a>),
}

impl PartialEq for Value<'_> {
    fn eq(&self, other: &Value<'_>) -> bool {
        use Value::*;
        match (self, other) {
            (I8(a), I8(b)) => a == b,
            (U8(a), U8(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (U16(a), U16(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (U32(a), U32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            (F32(a), F32(b)) => a == b,
            (F64(a), F64(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Buf(a), Buf(b)) => a == b,
            (Fd(a), Fd(b)) => a.as_raw_fd() == b.as_raw_fd(),
            _ => false,
        }
    }
}

/// Appends TLV arguments to a message under construction.
///
/// Created with [`Encoder::new`] on a message that has been
/// [`init`](Msg::init)-ed and not yet [`finish`](Msg::finish)-ed.
pub struct Encoder<'m> {
    msg: &'m mut Msg,
}

impl<'m> Encoder<'m> {
    pub fn new(msg: &'m mut Msg) -> Result<Encoder<'m>> {
        if msg.is_finished() {
            return Err(Error::ReadOnly);
        }
        if !msg.is_building() {
            return Err(Error::InvalidArgument);
        }
        Ok(Encoder { msg })
    }

    fn buf(&mut self) -> &mut Buffer {
        self.msg.building_buf_mut()
    }

    fn put(&mut self, tag: Tag, body: &[u8]) -> Result<()> {
        let b = self.buf();
        b.reserve(1 + body.len());
        b.write_u8(tag as u8)?;
        b.append(body);
        Ok(())
    }

    pub fn write_i8(&mut self, v: i8) -> Result<()> {
        self.put(Tag::I8, &v.to_le_bytes())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.put(Tag::U8, &v.to_le_bytes())
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.put(Tag::I16, &v.to_le_bytes())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.put(Tag::U16, &v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.put(Tag::I32, &v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.put(Tag::U32, &v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.put(Tag::I64, &v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.put(Tag::U64, &v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.put(Tag::F32, &v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.put(Tag::F64, &v.to_le_bytes())
    }

    /// Encode a string: `u32` length including the trailing NUL, the
    /// UTF-8 bytes, then the NUL. Interior NULs are rejected since the
    /// peer decodes up to the terminator.
    pub fn write_str(&mut self, v: &str) -> Result<()> {
        if v.as_bytes().contains(&0) {
            return Err(Error::InvalidArgument);
        }
        let len = u32::try_from(v.len() + 1).map_err(|_| Error::InvalidArgument)?;
        let b = self.buf();
        b.reserve(5 + v.len() + 1);
        b.write_u8(Tag::Str as u8)?;
        b.write_u32::<LittleEndian>(len)?;
        b.append(v.as_bytes());
        b.write_u8(0)?;
        Ok(())
    }

    /// Encode a raw byte buffer: `u32` length then the bytes.
    pub fn write_buf(&mut self, v: &[u8]) -> Result<()> {
        let len = u32::try_from(v.len()).map_err(|_| Error::InvalidArgument)?;
        let b = self.buf();
        b.reserve(5 + v.len());
        b.write_u8(Tag::Buf as u8)?;
        b.write_u32::<LittleEndian>(len)?;
        b.append(v);
        Ok(())
    }

    /// Encode a file descriptor. The descriptor is duplicated into the
    /// message buffer (closed when the message is released) and the wire
    /// body is its index in the ancillary list.
    pub fn write_fd(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        if self.buf().fds().len() >= sys::SCM_MAX_FD {
            return Err(Error::InvalidArgument);
        }
        let idx = self.buf().append_fd(fd)?;
        self.put(Tag::Fd, &idx.to_le_bytes())
    }

    /// Encode `args` as described by `fmt`. Each specifier must match the
    /// type of the supplied value; `%x` additionally accepts a
    /// [`Value::Fd`].
    pub fn write(&mut self, fmt: &str, args: &[Value<'_>]) -> Result<()> {
        let specs = format::parse(fmt)?;
        if specs.len() != args.len() {
            return Err(Error::InvalidArgument);
        }
        for (spec, arg) in specs.iter().zip(args) {
            match (spec, arg) {
                (Spec::I8, Value::I8(v)) => self.write_i8(*v)?,
                (Spec::U8, Value::U8(v)) => self.write_u8(*v)?,
                (Spec::I16, Value::I16(v)) => self.write_i16(*v)?,
                (Spec::U16, Value::U16(v)) => self.write_u16(*v)?,
                (Spec::I32, Value::I32(v)) => self.write_i32(*v)?,
                (Spec::U32, Value::U32(v)) => self.write_u32(*v)?,
                (Spec::I64, Value::I64(v)) => self.write_i64(*v)?,
                (Spec::U64, Value::U64(v)) => self.write_u64(*v)?,
                (Spec::F32, Value::F32(v)) => self.write_f32(*v)?,
                (Spec::F64, Value::F64(v)) => self.write_f64(*v)?,
                (Spec::Hex, Value::U32(v)) => self.write_u32(*v)?,
                (Spec::Hex, Value::Fd(fd)) => self.write_fd(fd.as_fd())?,
                (Spec::Str | Spec::StrOwned, Value::Str(s)) => self.write_str(s)?,
                (Spec::Buf, Value::Buf(b)) => self.write_buf(b)?,
                _ => return Err(Error::InvalidArgument),
            }
        }
        Ok(())
    }

    /// Encode string-rendered arguments as described by `fmt`, converting
    /// each one per its specifier (`strtoll`-style base detection for
    /// integers). There is no string rendition of a buffer or a
    /// descriptor, so `%p`/`%x`-as-fd are not available here.
    pub fn write_argv(&mut self, fmt: &str, argv: &[&str]) -> Result<()> {
        let specs = format::parse(fmt)?;
        if specs.len() != argv.len() {
            return Err(Error::InvalidArgument);
        }
        for (spec, s) in specs.iter().zip(argv) {
            match spec {
                Spec::I8 => {
                    let v = i8::try_from(parse_i64(s)?).map_err(|_| Error::InvalidArgument)?;
                    self.write_i8(v)?;
                }
                Spec::U8 => {
                    let v = u8::try_from(parse_u64(s)?).map_err(|_| Error::InvalidArgument)?;
                    self.write_u8(v)?;
                }
                Spec::I16 => {
                    let v = i16::try_from(parse_i64(s)?).map_err(|_| Error::InvalidArgument)?;
                    self.write_i16(v)?;
                }
                Spec::U16 => {
                    let v = u16::try_from(parse_u64(s)?).map_err(|_| Error::InvalidArgument)?;
                    self.write_u16(v)?;
                }
                Spec::I32 => {
                    let v = i32::try_from(parse_i64(s)?).map_err(|_| Error::InvalidArgument)?;
                    self.write_i32(v)?;
                }
                Spec::U32 | Spec::Hex => {
                    let v = u32::try_from(parse_u64(s)?).map_err(|_| Error::InvalidArgument)?;
                    self.write_u32(v)?;
                }
                Spec::I64 => self.write_i64(parse_i64(s)?)?,
                Spec::U64 => self.write_u64(parse_u64(s)?)?,
                Spec::F32 => {
                    let v = s.trim().parse::<f32>().map_err(|_| Error::InvalidArgument)?;
                    self.write_f32(v)?;
                }
                Spec::F64 => {
                    let v = s.trim().parse::<f64>().map_err(|_| Error::InvalidArgument)?;
                    self.write_f64(v)?;
                }
                Spec::Str | Spec::StrOwned => self.write_str(s)?,
                Spec::Buf => return Err(Error::InvalidArgument),
            }
        }
        Ok(())
    }
}

/// `strtoull`-style unsigned parse: `0x` prefix is hex, a leading `0` is
/// octal, anything else decimal.
fn parse_u64(s: &str) -> Result<u64> {
    let t = s.trim();
    let t = t.strip_prefix('+').unwrap_or(t);
    let parsed = if let Some(h) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u64::from_str_radix(h, 16)
    } else if t.len() > 1 && t.starts_with('0') {
        u64::from_str_radix(&t[1..], 8)
    } else {
        t.parse::<u64>()
    };
    parsed.map_err(|_| Error::InvalidArgument)
}

/// `strtoll`-style signed parse with the same base detection.
fn parse_i64(s: &str) -> Result<i64> {
    let t = s.trim();
    if let Some(rest) = t.strip_prefix('-') {
        let m = parse_u64(rest)?;
        if m > i64::MAX as u64 + 1 {
            return Err(Error::InvalidArgument);
        }
        Ok((m as i128).wrapping_neg() as i64)
    } else {
        let m = parse_u64(t)?;
        i64::try_from(m).map_err(|_| Error::InvalidArgument)
    }
}

/// Reads TLV arguments back out of a finished message, in encode order.
///
/// Borrowing readers hand out slices into the message payload; they stay
/// valid for as long as the message. A failed read leaves the cursor
/// where it was.
pub struct Decoder<'m> {
    msgid: u32,
    payload: &'m [u8],
    fds: &'m [std::os::unix::io::OwnedFd],
    pos: usize,
}

impl<'m> Decoder<'m> {
    pub(crate) fn new(
        msgid: u32,
        payload: &'m [u8],
        fds: &'m [std::os::unix::io::OwnedFd],
    ) -> Decoder<'m> {
        Decoder { msgid, payload, fds, pos: 0 }
    }

    /// Reset the cursor to the first argument.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// True once every argument has been consumed.
    pub fn at_end(&self) -> bool {
        self.pos == self.payload.len()
    }

    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let save = self.pos;
        let r = f(self);
        if r.is_err() {
            self.pos = save;
        }
        r
    }

    fn take(&mut self, n: usize) -> Result<&'m [u8]> {
        let p: &'m [u8] = self.payload;
        if p.len() - self.pos < n {
            return Err(Error::Protocol);
        }
        let s = &p[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn peek_tag(&self) -> Result<Tag> {
        let b = *self.payload.get(self.pos).ok_or(Error::Protocol)?;
        Tag::from_u8(b).ok_or(Error::Protocol)
    }

    fn expect_tag(&mut self, want: Tag) -> Result<()> {
        let got = self.peek_tag()?;
        if got != want {
            return Err(Error::InvalidArgument);
        }
        self.pos += 1;
        Ok(())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.scoped(|d| {
            d.expect_tag(Tag::I8)?;
            Ok(d.take(1)?[0] as i8)
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.scoped(|d| {
            d.expect_tag(Tag::U8)?;
            Ok(d.take(1)?[0])
        })
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.scoped(|d| {
            d.expect_tag(Tag::I16)?;
            Ok(LittleEndian::read_i16(d.take(2)?))
        })
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.scoped(|d| {
            d.expect_tag(Tag::U16)?;
            Ok(LittleEndian::read_u16(d.take(2)?))
        })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.scoped(|d| {
            d.expect_tag(Tag::I32)?;
            Ok(LittleEndian::read_i32(d.take(4)?))
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.scoped(|d| {
            d.expect_tag(Tag::U32)?;
            Ok(LittleEndian::read_u32(d.take(4)?))
        })
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.scoped(|d| {
            d.expect_tag(Tag::I64)?;
            Ok(LittleEndian::read_i64(d.take(8)?))
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.scoped(|d| {
            d.expect_tag(Tag::U64)?;
            Ok(LittleEndian::read_u64(d.take(8)?))
        })
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.scoped(|d| {
            d.expect_tag(Tag::F32)?;
            Ok(LittleEndian::read_f32(d.take(4)?))
        })
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.scoped(|d| {
            d.expect_tag(Tag::F64)?;
            Ok(LittleEndian::read_f64(d.take(8)?))
        })
    }

    /// Borrow a string argument straight out of the message.
    pub fn read_str(&mut self) -> Result<&'m str> {
        self.scoped(|d| {
            d.expect_tag(Tag::Str)?;
            let len = LittleEndian::read_u32(d.take(4)?) as usize;
            if len == 0 {
                return Err(Error::Protocol);
            }
            let bytes = d.take(len)?;
            if bytes[len - 1] != 0 {
                return Err(Error::Protocol);
            }
            std::str::from_utf8(&bytes[..len - 1]).map_err(|_| Error::Protocol)
        })
    }

    /// Copy a string argument into owned storage.
    pub fn read_string(&mut self) -> Result<String> {
        self.read_str().map(str::to_owned)
    }

    /// Borrow a buffer argument straight out of the message.
    pub fn read_bytes(&mut self) -> Result<&'m [u8]> {
        self.scoped(|d| {
            d.expect_tag(Tag::Buf)?;
            let len = LittleEndian::read_u32(d.take(4)?) as usize;
            d.take(len)
        })
    }

    /// Copy a buffer argument into owned storage.
    pub fn read_buf(&mut self) -> Result<Vec<u8>> {
        self.read_bytes().map(<[u8]>::to_vec)
    }

    /// Borrow a file descriptor argument. The descriptor stays owned by
    /// the message; duplicate it to use it past the message's lifetime.
    pub fn read_fd(&mut self) -> Result<BorrowedFd<'m>> {
        self.scoped(|d| {
            d.expect_tag(Tag::Fd)?;
            let idx = LittleEndian::read_u32(d.take(4)?) as usize;
            let fds: &'m [std::os::unix::io::OwnedFd] = d.fds;
            fds.get(idx).map(|fd| fd.as_fd()).ok_or(Error::Protocol)
        })
    }

    /// Read arguments as described by `fmt`, verifying each wire tag
    /// against its specifier. `%x` accepts either a `u32` or an fd.
    pub fn read(&mut self, fmt: &str) -> Result<Vec<Value<'m>>> {
        let specs = format::parse(fmt)?;
        let mut out = Vec::with_capacity(specs.len());
        for spec in specs {
            let v = match spec {
                Spec::I8 => Value::I8(self.read_i8()?),
                Spec::U8 => Value::U8(self.read_u8()?),
                Spec::I16 => Value::I16(self.read_i16()?),
                Spec::U16 => Value::U16(self.read_u16()?),
                Spec::I32 => Value::I32(self.read_i32()?),
                Spec::U32 => Value::U32(self.read_u32()?),
                Spec::I64 => Value::I64(self.read_i64()?),
                Spec::U64 => Value::U64(self.read_u64()?),
                Spec::F32 => Value::F32(self.read_f32()?),
                Spec::F64 => Value::F64(self.read_f64()?),
                Spec::Str | Spec::StrOwned => Value::Str(self.read_str()?),
                Spec::Buf => Value::Buf(self.read_bytes()?),
                Spec::Hex => match self.peek_tag()? {
                    Tag::Fd => Value::Fd(self.read_fd()?),
                    _ => Value::U32(self.read_u32()?),
                },
            };
            out.push(v);
        }
        Ok(out)
    }

    /// Render the message in the `"id=<msgid> <arg>, <arg>, ..."` form.
    pub fn dump(&mut self) -> Result<String> {
        self.rewind();
        let mut out = format!("id={}", self.msgid);
        let mut first = true;
        while !self.at_end() {
            out.push_str(if first { " " } else { ", " });
            first = false;
            match self.peek_tag()? {
                Tag::I8 => {
                    let _ = write!(out, "{}", self.read_i8()?);
                }
                Tag::U8 => {
                    let _ = write!(out, "{}", self.read_u8()?);
                }
                Tag::I16 => {
                    let _ = write!(out, "{}", self.read_i16()?);
                }
                Tag::U16 => {
                    let _ = write!(out, "{}", self.read_u16()?);
                }
                Tag::I32 => {
                    let _ = write!(out, "{}", self.read_i32()?);
                }
                Tag::U32 => {
                    let _ = write!(out, "{}", self.read_u32()?);
                }
                Tag::I64 => {
                    let _ = write!(out, "{}", self.read_i64()?);
                }
                Tag::U64 => {
                    let _ = write!(out, "{}", self.read_u64()?);
                }
                Tag::F32 => {
                    let _ = write!(out, "{}", self.read_f32()?);
                }
                Tag::F64 => {
                    let _ = write!(out, "{}", self.read_f64()?);
                }
                Tag::Str => {
                    let _ = write!(out, "'{}'", self.read_str()?.escape_default());
                }
                Tag::Buf => {
                    let b = self.read_bytes()?;
                    let _ = write!(out, "hex({}):", b.len());
                    for byte in b.iter().take(32) {
                        let _ = write!(out, "{byte:02x}");
                    }
                    if b.len() > 32 {
                        out.push_str("...");
                    }
                }
                Tag::Fd => {
                    let _ = write!(out, "fd:{}", self.read_fd()?.as_raw_fd());
                }
            }
        }
        Ok(out)
    }

    /// Like [`dump`](Decoder::dump), capped at `max` bytes; a truncated
    /// rendering ends with `...` when room permits.
    pub fn dump_truncated(&mut self, max: usize) -> Result<String> {
        Ok(truncate_with_ellipsis(self.dump()?, max))
    }
}

fn truncate_with_ellipsis(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let keep = max.saturating_sub(3);
    let mut cut = keep;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    if max >= 3 {
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Msg;
    use std::os::unix::io::AsFd;

    fn round_trip(fmt: &str, args: &[Value<'_>]) -> Msg {
        let mut msg = Msg::new();
        msg.write(7, fmt, args).unwrap();
        msg
    }

    #[test]
    fn typed_round_trips() {
        let mut msg = Msg::new();
        msg.init(9).unwrap();
        {
            let mut enc = Encoder::new(&mut msg).unwrap();
            enc.write_i8(-8).unwrap();
            enc.write_u8(200).unwrap();
            enc.write_i16(-30000).unwrap();
            enc.write_u16(60000).unwrap();
            enc.write_i32(-2_000_000_000).unwrap();
            enc.write_u32(4_000_000_000).unwrap();
            enc.write_i64(i64::MIN).unwrap();
            enc.write_u64(u64::MAX).unwrap();
            enc.write_f32(1.5).unwrap();
            enc.write_f64(-2.25).unwrap();
            enc.write_str("héllo").unwrap();
            enc.write_buf(&[0, 1, 2, 255]).unwrap();
        }
        msg.finish().unwrap();

        let mut dec = msg.decoder().unwrap();
        assert_eq!(dec.read_i8().unwrap(), -8);
        assert_eq!(dec.read_u8().unwrap(), 200);
        assert_eq!(dec.read_i16().unwrap(), -30000);
        assert_eq!(dec.read_u16().unwrap(), 60000);
        assert_eq!(dec.read_i32().unwrap(), -2_000_000_000);
        assert_eq!(dec.read_u32().unwrap(), 4_000_000_000);
        assert_eq!(dec.read_i64().unwrap(), i64::MIN);
        assert_eq!(dec.read_u64().unwrap(), u64::MAX);
        assert_eq!(dec.read_f32().unwrap(), 1.5);
        assert_eq!(dec.read_f64().unwrap(), -2.25);
        assert_eq!(dec.read_str().unwrap(), "héllo");
        assert_eq!(dec.read_bytes().unwrap(), &[0, 1, 2, 255]);
        assert!(dec.at_end());
    }

    #[test]
    fn format_driven_round_trip() {
        let args = [
            Value::Str("hello"),
            Value::U32(7),
            Value::I64(-42),
            Value::F64(3.5),
        ];
        let msg = round_trip("%s %u %lld %lf", &args);
        let read = msg.read("%s %u %lld %lf").unwrap();
        assert_eq!(read, args);
    }

    #[test]
    fn known_wire_bytes() {
        // "%s %u" with ("hello", 7): str tag, len 6 incl NUL, bytes, NUL,
        // then u32 tag and body.
        let msg = round_trip("%s %u", &[Value::Str("hello"), Value::U32(7)]);
        let bytes = msg.as_bytes().unwrap();
        let expect = [
            0x09, 0x06, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o', 0x00, //
            0x06, 0x07, 0x00, 0x00, 0x00,
        ];
        assert_eq!(&bytes[12..], &expect[..]);
    }

    #[test]
    fn mismatched_tag_does_not_advance() {
        let msg = round_trip("%u", &[Value::U32(1)]);
        let mut dec = msg.decoder().unwrap();
        assert!(matches!(dec.read_i32(), Err(Error::InvalidArgument)));
        assert!(matches!(dec.read_str(), Err(Error::InvalidArgument)));
        // cursor untouched, the right read still works
        assert_eq!(dec.read_u32().unwrap(), 1);
    }

    #[test]
    fn wrong_value_type_rejected() {
        let mut msg = Msg::new();
        msg.init(1).unwrap();
        let mut enc = Encoder::new(&mut msg).unwrap();
        assert!(matches!(
            enc.write("%u", &[Value::I32(3)]),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            enc.write("%s", &[Value::U32(3)]),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            enc.write("%d %d", &[Value::I32(3)]),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn interior_nul_rejected() {
        let mut msg = Msg::new();
        msg.init(1).unwrap();
        let mut enc = Encoder::new(&mut msg).unwrap();
        assert!(matches!(
            enc.write_str("a\0b"),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn fd_round_trip_via_hex() {
        let file = tempfile::tempfile().unwrap();
        let msg = round_trip("%x", &[Value::Fd(file.as_fd())]);
        let mut dec = msg.decoder().unwrap();
        let fd = dec.read_fd().unwrap();
        assert_ne!(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) }, -1);

        // plain %x still carries a u32
        let msg = round_trip("%x", &[Value::U32(0xdead)]);
        assert_eq!(msg.read("%x").unwrap(), [Value::U32(0xdead)]);
    }

    #[test]
    fn argv_conversions() {
        let mut msg = Msg::new();
        msg.init(3).unwrap();
        {
            let mut enc = Encoder::new(&mut msg).unwrap();
            enc.write_argv(
                "%d %u %x %lld %hhd %f %s",
                &["-12", "0x10", "0777", "-9000000000", "7", "1.5", "cli"],
            )
            .unwrap();
        }
        msg.finish().unwrap();
        let mut dec = msg.decoder().unwrap();
        assert_eq!(dec.read_i32().unwrap(), -12);
        assert_eq!(dec.read_u32().unwrap(), 16);
        assert_eq!(dec.read_u32().unwrap(), 0o777);
        assert_eq!(dec.read_i64().unwrap(), -9_000_000_000);
        assert_eq!(dec.read_i8().unwrap(), 7);
        assert_eq!(dec.read_f32().unwrap(), 1.5);
        assert_eq!(dec.read_str().unwrap(), "cli");
    }

    #[test]
    fn argv_failures() {
        let mut msg = Msg::new();
        msg.init(3).unwrap();
        let mut enc = Encoder::new(&mut msg).unwrap();
        assert!(matches!(
            enc.write_argv("%d", &["twelve"]),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            enc.write_argv("%hhd", &["300"]),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(
            enc.write_argv("%p%u", &["whatever"]),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn dump_rendering() {
        let msg = round_trip(
            "%s %u %hhd",
            &[Value::Str("a'b\n"), Value::U32(7), Value::I8(-1)],
        );
        let dump = msg.dump().unwrap();
        assert_eq!(dump, "id=7 'a\\'b\\n', 7, -1");

        let msg = round_trip("%p%u", &[Value::Buf(&[0xde, 0xad])]);
        assert_eq!(msg.dump().unwrap(), "id=7 hex(2):dead");

        let big = vec![0xab; 40];
        let msg = round_trip("%p%u", &[Value::Buf(&big)]);
        let dump = msg.dump().unwrap();
        assert!(dump.starts_with("id=7 hex(40):"));
        assert!(dump.ends_with("..."));
    }

    #[test]
    fn dump_truncation() {
        let msg = round_trip("%s", &[Value::Str("a very long string payload")]);
        let full = msg.dump().unwrap();
        let cut = msg.dump_truncated(10).unwrap();
        assert!(full.len() > 10);
        assert_eq!(cut.len(), 10);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn strtol_style_parsing() {
        assert_eq!(parse_u64("0x1f").unwrap(), 31);
        assert_eq!(parse_u64("017").unwrap(), 15);
        assert_eq!(parse_u64("0").unwrap(), 0);
        assert_eq!(parse_i64("-0x10").unwrap(), -16);
        assert_eq!(parse_i64("+5").unwrap(), 5);
        assert!(parse_u64("-1").is_err());
        assert!(parse_i64("abc").is_err());
    }
}
