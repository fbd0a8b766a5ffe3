//! CBOR pack/unpack primitives used by every wire format in the crate.
//!
//! Packing appends to a [`GrowBuf`]; unpacking consumes from a `&[u8]`
//! cursor. Deserialization is transactional: every `unpack_*` function
//! decodes from a copy of the caller's cursor and only advances it on
//! success, so a malformed byte never leaves the cursor half-way through
//! an item.
//!
//! All multi-byte integers are big-endian and the additional-info tiers
//! are the standard 24/25/26/27 encodings for 1/2/4/8-byte lengths.

use crate::buffer::GrowBuf;

const MAJOR_UINT: u8 = 0;
const MAJOR_NEGINT: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_SIMPLE: u8 = 7;

const AI_ONE_BYTE: u8 = 24;
const AI_TWO_BYTES: u8 = 25;
const AI_FOUR_BYTES: u8 = 26;
const AI_EIGHT_BYTES: u8 = 27;
const AI_INDEFINITE: u8 = 31;

const SIMPLE_FALSE: u8 = 20;
const SIMPLE_TRUE: u8 = 21;
const SIMPLE_NULL: u8 = 22;

pub const BREAK: u8 = 0xff;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected major type {major} (additional info {info})")]
    UnexpectedType { major: u8, info: u8 },
    #[error("malformed additional info {info}")]
    MalformedInfo { info: u8 },
    #[error("item length {length} exceeds remaining input {remaining}")]
    LengthOverflow { length: u64, remaining: usize },
    #[error("invalid UTF-8 in text string")]
    InvalidUtf8,
    #[error("buffer error: {0}")]
    Buffer(#[from] crate::buffer::Error),
}

/// Length prefix of an array or map. `None` means indefinite, terminated
/// by a break marker.
pub type ItemCount = Option<u64>;

fn pack_head(buf: &mut GrowBuf, major: u8, value: u64) -> Result<(), Error> {
    let major = major << 5;
    if value < 24 {
        buf.append_u8(major | value as u8)?;
    }
    else if value <= u8::MAX as u64 {
        buf.append_u8(major | AI_ONE_BYTE)?;
        buf.append_u8(value as u8)?;
    }
    else if value <= u16::MAX as u64 {
        buf.append_u8(major | AI_TWO_BYTES)?;
        buf.append(&(value as u16).to_be_bytes())?;
    }
    else if value <= u32::MAX as u64 {
        buf.append_u8(major | AI_FOUR_BYTES)?;
        buf.append(&(value as u32).to_be_bytes())?;
    }
    else {
        buf.append_u8(major | AI_EIGHT_BYTES)?;
        buf.append(&value.to_be_bytes())?;
    }
    Ok(())
}

pub fn pack_uint(buf: &mut GrowBuf, value: u64) -> Result<(), Error> {
    pack_head(buf, MAJOR_UINT, value)
}

pub fn pack_int(buf: &mut GrowBuf, value: i64) -> Result<(), Error> {
    if value < 0 {
        pack_head(buf, MAJOR_NEGINT, !(value as u64))
    }
    else {
        pack_head(buf, MAJOR_UINT, value as u64)
    }
}

pub fn pack_bool(buf: &mut GrowBuf, value: bool) -> Result<(), Error> {
    let simple = if value { SIMPLE_TRUE } else { SIMPLE_FALSE };
    buf.append_u8(MAJOR_SIMPLE << 5 | simple)?;
    Ok(())
}

pub fn pack_null(buf: &mut GrowBuf) -> Result<(), Error> {
    buf.append_u8(MAJOR_SIMPLE << 5 | SIMPLE_NULL)?;
    Ok(())
}

pub fn pack_float(buf: &mut GrowBuf, value: f32) -> Result<(), Error> {
    buf.append_u8(MAJOR_SIMPLE << 5 | AI_FOUR_BYTES)?;
    buf.append(&value.to_bits().to_be_bytes())?;
    Ok(())
}

pub fn pack_double(buf: &mut GrowBuf, value: f64) -> Result<(), Error> {
    buf.append_u8(MAJOR_SIMPLE << 5 | AI_EIGHT_BYTES)?;
    buf.append(&value.to_bits().to_be_bytes())?;
    Ok(())
}

pub fn pack_bytes(buf: &mut GrowBuf, value: &[u8]) -> Result<(), Error> {
    pack_head(buf, MAJOR_BYTES, value.len() as u64)?;
    buf.append(value)?;
    Ok(())
}

pub fn pack_str(buf: &mut GrowBuf, value: &str) -> Result<(), Error> {
    pack_head(buf, MAJOR_TEXT, value.len() as u64)?;
    buf.append(value.as_bytes())?;
    Ok(())
}

/// `count: None` starts an indefinite array that must be closed with
/// [`pack_break`].
pub fn pack_array_start(buf: &mut GrowBuf, count: ItemCount) -> Result<(), Error> {
    match count {
        Some(count) => pack_head(buf, MAJOR_ARRAY, count),
        None => {
            buf.append_u8(MAJOR_ARRAY << 5 | AI_INDEFINITE)?;
            Ok(())
        }
    }
}

pub fn pack_map_start(buf: &mut GrowBuf, count: ItemCount) -> Result<(), Error> {
    match count {
        Some(count) => pack_head(buf, MAJOR_MAP, count),
        None => {
            buf.append_u8(MAJOR_MAP << 5 | AI_INDEFINITE)?;
            Ok(())
        }
    }
}

pub fn pack_break(buf: &mut GrowBuf) -> Result<(), Error> {
    buf.append_u8(BREAK)?;
    Ok(())
}

fn take(cursor: &mut &[u8], n: usize) -> Result<Vec<u8>, Error> {
    if cursor.len() < n {
        return Err(Error::UnexpectedEof);
    }
    let (head, tail) = cursor.split_at(n);
    let out = head.to_vec();
    *cursor = tail;
    Ok(out)
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8, Error> {
    let byte = *cursor.first().ok_or(Error::UnexpectedEof)?;
    *cursor = &cursor[1..];
    Ok(byte)
}

fn unpack_head(cursor: &mut &[u8]) -> Result<(u8, u8, u64), Error> {
    let initial = take_u8(cursor)?;
    let major = initial >> 5;
    let info = initial & 0x1f;

    let value = match info {
        0..AI_ONE_BYTE => info as u64,
        AI_ONE_BYTE => take_u8(cursor)? as u64,
        AI_TWO_BYTES => {
            let raw = take(cursor, 2)?;
            u16::from_be_bytes([raw[0], raw[1]]) as u64
        }
        AI_FOUR_BYTES => {
            let raw = take(cursor, 4)?;
            u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64
        }
        AI_EIGHT_BYTES => {
            let raw = take(cursor, 8)?;
            u64::from_be_bytes(raw.try_into().unwrap())
        }
        AI_INDEFINITE => u64::MAX,
        _ => return Err(Error::MalformedInfo { info }),
    };

    Ok((major, info, value))
}

pub fn unpack_uint(cursor: &mut &[u8]) -> Result<u64, Error> {
    let mut work = *cursor;
    let (major, info, value) = unpack_head(&mut work)?;
    if major != MAJOR_UINT || info == AI_INDEFINITE {
        return Err(Error::UnexpectedType { major, info });
    }
    *cursor = work;
    Ok(value)
}

pub fn unpack_int(cursor: &mut &[u8]) -> Result<i64, Error> {
    let mut work = *cursor;
    let (major, info, value) = unpack_head(&mut work)?;
    let out = match major {
        MAJOR_UINT if info != AI_INDEFINITE => value as i64,
        MAJOR_NEGINT if info != AI_INDEFINITE => !(value as i64),
        _ => return Err(Error::UnexpectedType { major, info }),
    };
    *cursor = work;
    Ok(out)
}

pub fn unpack_bool(cursor: &mut &[u8]) -> Result<bool, Error> {
    let mut work = *cursor;
    let (major, info, _) = unpack_head(&mut work)?;
    if major != MAJOR_SIMPLE {
        return Err(Error::UnexpectedType { major, info });
    }
    let out = match info {
        SIMPLE_FALSE => false,
        SIMPLE_TRUE => true,
        _ => return Err(Error::UnexpectedType { major, info }),
    };
    *cursor = work;
    Ok(out)
}

pub fn unpack_null(cursor: &mut &[u8]) -> Result<(), Error> {
    let mut work = *cursor;
    let (major, info, _) = unpack_head(&mut work)?;
    if major != MAJOR_SIMPLE || info != SIMPLE_NULL {
        return Err(Error::UnexpectedType { major, info });
    }
    *cursor = work;
    Ok(())
}

/// Accepts both single and double precision encodings.
pub fn unpack_double(cursor: &mut &[u8]) -> Result<f64, Error> {
    let mut work = *cursor;
    let (major, info, value) = unpack_head(&mut work)?;
    if major != MAJOR_SIMPLE {
        return Err(Error::UnexpectedType { major, info });
    }
    let out = match info {
        AI_FOUR_BYTES => f32::from_bits(value as u32) as f64,
        AI_EIGHT_BYTES => f64::from_bits(value),
        _ => return Err(Error::UnexpectedType { major, info }),
    };
    *cursor = work;
    Ok(out)
}

pub fn unpack_float(cursor: &mut &[u8]) -> Result<f32, Error> {
    Ok(unpack_double(cursor)? as f32)
}

pub fn unpack_bytes(cursor: &mut &[u8]) -> Result<Vec<u8>, Error> {
    let mut work = *cursor;
    let (major, info, length) = unpack_head(&mut work)?;
    if major != MAJOR_BYTES || info == AI_INDEFINITE {
        return Err(Error::UnexpectedType { major, info });
    }
    if length > work.len() as u64 {
        return Err(Error::LengthOverflow {
            length,
            remaining: work.len(),
        });
    }
    let out = take(&mut work, length as usize)?;
    *cursor = work;
    Ok(out)
}

pub fn unpack_str(cursor: &mut &[u8]) -> Result<String, Error> {
    let mut work = *cursor;
    let (major, info, length) = unpack_head(&mut work)?;
    if major != MAJOR_TEXT || info == AI_INDEFINITE {
        return Err(Error::UnexpectedType { major, info });
    }
    if length > work.len() as u64 {
        return Err(Error::LengthOverflow {
            length,
            remaining: work.len(),
        });
    }
    let raw = take(&mut work, length as usize)?;
    let out = String::from_utf8(raw).map_err(|_| Error::InvalidUtf8)?;
    *cursor = work;
    Ok(out)
}

pub fn unpack_array_start(cursor: &mut &[u8]) -> Result<ItemCount, Error> {
    let mut work = *cursor;
    let (major, info, count) = unpack_head(&mut work)?;
    if major != MAJOR_ARRAY {
        return Err(Error::UnexpectedType { major, info });
    }
    *cursor = work;
    Ok((info != AI_INDEFINITE).then_some(count))
}

pub fn unpack_map_start(cursor: &mut &[u8]) -> Result<ItemCount, Error> {
    let mut work = *cursor;
    let (major, info, count) = unpack_head(&mut work)?;
    if major != MAJOR_MAP {
        return Err(Error::UnexpectedType { major, info });
    }
    *cursor = work;
    Ok((info != AI_INDEFINITE).then_some(count))
}

/// Consume a break marker if one is next. Returns whether it was
/// consumed.
pub fn unpack_break(cursor: &mut &[u8]) -> Result<bool, Error> {
    match cursor.first() {
        None => Err(Error::UnexpectedEof),
        Some(&BREAK) => {
            *cursor = &cursor[1..];
            Ok(true)
        }
        Some(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(f: impl FnOnce(&mut GrowBuf)) -> Vec<u8> {
        let mut buf = GrowBuf::new();
        f(&mut buf);
        buf.finalize()
    }

    #[test]
    fn uint_tiers() {
        assert_eq!(packed(|b| pack_uint(b, 10).unwrap()), vec![0x0a]);
        assert_eq!(packed(|b| pack_uint(b, 25).unwrap()), vec![0x18, 25]);
        assert_eq!(packed(|b| pack_uint(b, 500).unwrap()), vec![0x19, 0x01, 0xf4]);
        assert_eq!(
            packed(|b| pack_uint(b, 70000).unwrap()),
            vec![0x1a, 0x00, 0x01, 0x11, 0x70]
        );
        assert_eq!(
            packed(|b| pack_uint(b, 1 << 40).unwrap()),
            vec![0x1b, 0, 0, 0, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn int_round_trip() {
        for value in [0i64, -1, 1, -24, 24, -256, 65535, i64::MIN, i64::MAX] {
            let data = packed(|b| pack_int(b, value).unwrap());
            let mut cursor = &data[..];
            assert_eq!(unpack_int(&mut cursor).unwrap(), value);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn text_and_bytes_round_trip() {
        let data = packed(|b| {
            pack_str(b, "antenna").unwrap();
            pack_bytes(b, &[1, 2, 3]).unwrap();
        });
        let mut cursor = &data[..];
        assert_eq!(unpack_str(&mut cursor).unwrap(), "antenna");
        assert_eq!(unpack_bytes(&mut cursor).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn floats_round_trip() {
        let data = packed(|b| {
            pack_float(b, 1.5).unwrap();
            pack_double(b, -2.25).unwrap();
        });
        let mut cursor = &data[..];
        assert_eq!(unpack_float(&mut cursor).unwrap(), 1.5);
        assert_eq!(unpack_double(&mut cursor).unwrap(), -2.25);
    }

    #[test]
    fn indefinite_array_terminated_by_break() {
        let data = packed(|b| {
            pack_array_start(b, None).unwrap();
            pack_uint(b, 1).unwrap();
            pack_uint(b, 2).unwrap();
            pack_break(b).unwrap();
        });
        let mut cursor = &data[..];
        assert_eq!(unpack_array_start(&mut cursor).unwrap(), None);
        assert_eq!(unpack_uint(&mut cursor).unwrap(), 1);
        assert!(!unpack_break(&mut cursor).unwrap());
        assert_eq!(unpack_uint(&mut cursor).unwrap(), 2);
        assert!(unpack_break(&mut cursor).unwrap());
    }

    #[test]
    fn failed_unpack_leaves_cursor_untouched() {
        let data = packed(|b| pack_str(b, "freq").unwrap());
        let mut cursor = &data[..];
        assert!(unpack_uint(&mut cursor).is_err());
        assert_eq!(cursor.len(), data.len());
        assert_eq!(unpack_str(&mut cursor).unwrap(), "freq");
    }

    #[test]
    fn truncated_length_is_overflow_not_panic() {
        // text of announced length 100 with only 2 bytes present
        let data = vec![0x78, 100, b'a', b'b'];
        let mut cursor = &data[..];
        assert!(matches!(
            unpack_str(&mut cursor),
            Err(Error::LengthOverflow { length: 100, .. })
        ));
        assert_eq!(cursor.len(), 4);
    }
}
