//! Format string parsing.
//!
//! The grammar is a narrow printf/scanf subset: a `%`, an optional length
//! modifier (`hh`, `h`, `l`, `ll`, `m`), and a conversion character. It is
//! compiled by a small hand-rolled scanner; anything outside the table
//! fails with [`Error::InvalidFormat`] instead of silently misencoding.

use crate::{Error, Result};

/// One argument slot described by a format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Spec {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// `%s`: NUL-terminated string.
    Str,
    /// `%ms`: same wire encoding as `%s`, decoded into owned storage.
    StrOwned,
    /// `%p` paired with `%u`: raw byte buffer.
    Buf,
    /// `%x`: a `u32`, or a file descriptor when the supplied argument is
    /// one. The wire tag disambiguates on decode.
    Hex,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Len {
    None,
    HH,
    H,
    L,
    LL,
    M,
}

/// Compile `fmt` into its argument slots.
///
/// Bytes outside specifiers are separators and are ignored; `%%` is a
/// literal percent sign and consumes no argument.
pub(crate) fn parse(fmt: &str) -> Result<Vec<Spec>> {
    let b = fmt.as_bytes();
    let mut specs = Vec::new();
    let mut i = 0;
    while i < b.len() {
        if b[i] != b'%' {
            i += 1;
            continue;
        }
        i += 1;
        if i >= b.len() {
            return Err(Error::InvalidFormat);
        }
        if b[i] == b'%' {
            i += 1;
            continue;
        }

        let mut len = Len::None;
        match b[i] {
            b'h' => {
                if b.get(i + 1) == Some(&b'h') {
                    len = Len::HH;
                    i += 2;
                } else {
                    len = Len::H;
                    i += 1;
                }
            }
            b'l' => {
                if b.get(i + 1) == Some(&b'l') {
                    len = Len::LL;
                    i += 2;
                } else {
                    len = Len::L;
                    i += 1;
                }
            }
            b'm' => {
                len = Len::M;
                i += 1;
            }
            _ => {}
        }

        let conv = *b.get(i).ok_or(Error::InvalidFormat)?;
        i += 1;

        let spec = match (len, conv) {
            (Len::HH, b'd' | b'i') => Spec::I8,
            (Len::HH, b'u' | b'x' | b'o') => Spec::U8,
            (Len::H, b'd' | b'i') => Spec::I16,
            (Len::H, b'u' | b'x' | b'o') => Spec::U16,
            (Len::None | Len::L, b'd' | b'i') => Spec::I32,
            (Len::None, b'u' | b'o') | (Len::L, b'u' | b'x' | b'o') => Spec::U32,
            (Len::None, b'x') => Spec::Hex,
            (Len::LL, b'd' | b'i') => Spec::I64,
            (Len::LL, b'u' | b'x' | b'o') => Spec::U64,
            (Len::None, b'f' | b'F' | b'g' | b'G' | b'e' | b'E') => Spec::F32,
            (Len::L, b'f' | b'F' | b'g' | b'G' | b'e' | b'E') => Spec::F64,
            (Len::None, b's') => Spec::Str,
            (Len::M, b's') => Spec::StrOwned,
            (Len::None, b'p') => {
                // A buffer is written as a pointer/size pair: the `%p`
                // must be followed by a `%u` carrying the size.
                while i < b.len() && b[i] != b'%' {
                    i += 1;
                }
                if i + 1 >= b.len() || b[i + 1] != b'u' {
                    return Err(Error::InvalidFormat);
                }
                i += 2;
                Spec::Buf
            }
            _ => return Err(Error::InvalidFormat),
        };
        specs.push(spec);
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_specifiers() {
        assert_eq!(parse("%hhd%hhi").unwrap(), vec![Spec::I8, Spec::I8]);
        assert_eq!(parse("%hhu %hhx %hho").unwrap(), vec![Spec::U8; 3]);
        assert_eq!(parse("%hd%hi").unwrap(), vec![Spec::I16, Spec::I16]);
        assert_eq!(parse("%hu%hx%ho").unwrap(), vec![Spec::U16; 3]);
        assert_eq!(parse("%d %i %ld %li").unwrap(), vec![Spec::I32; 4]);
        assert_eq!(parse("%u %o %lu %lx %lo").unwrap(), vec![Spec::U32; 5]);
        assert_eq!(parse("%lld%lli").unwrap(), vec![Spec::I64, Spec::I64]);
        assert_eq!(parse("%llu%llx%llo").unwrap(), vec![Spec::U64; 3]);
    }

    #[test]
    fn float_specifiers() {
        assert_eq!(parse("%f%F%g%G%e%E").unwrap(), vec![Spec::F32; 6]);
        assert_eq!(parse("%lf%lF%lg%lG%le%lE").unwrap(), vec![Spec::F64; 6]);
    }

    #[test]
    fn strings_buffers_and_hex() {
        assert_eq!(parse("%s").unwrap(), vec![Spec::Str]);
        assert_eq!(parse("%ms").unwrap(), vec![Spec::StrOwned]);
        assert_eq!(parse("%x").unwrap(), vec![Spec::Hex]);
        assert_eq!(parse("%p%u").unwrap(), vec![Spec::Buf]);
        assert_eq!(parse("%p %u").unwrap(), vec![Spec::Buf]);
        assert_eq!(parse("%s %u").unwrap(), vec![Spec::Str, Spec::U32]);
    }

    #[test]
    fn literals_are_skipped() {
        assert_eq!(parse("hello %d world").unwrap(), vec![Spec::I32]);
        assert_eq!(parse("100%% sure").unwrap(), vec![]);
        assert_eq!(parse("").unwrap(), vec![]);
    }

    #[test]
    fn rejects_unknown_and_incomplete() {
        assert!(matches!(parse("%q"), Err(Error::InvalidFormat)));
        assert!(matches!(parse("%"), Err(Error::InvalidFormat)));
        assert!(matches!(parse("%h"), Err(Error::InvalidFormat)));
        assert!(matches!(parse("%lls"), Err(Error::InvalidFormat)));
        assert!(matches!(parse("%p"), Err(Error::InvalidFormat)));
        assert!(matches!(parse("%p %d"), Err(Error::InvalidFormat)));
        assert!(matches!(parse("%mx"), Err(Error::InvalidFormat)));
    }
}
