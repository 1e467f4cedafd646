use byteorder::{ByteOrder, LittleEndian};

use crate::machine::Error;

/// Number of bytes `value` occupies as a Bitcoin compact-size integer.
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Writes `value` into the front of `buf` and returns the bytes used.
/// The buffer must hold at least `varint_size(value)` bytes.
pub fn write_varint(buf: &mut [u8], value: u64) -> usize {
    match value {
        0..=0xfc => {
            buf[0] = value as u8;
            1
        }
        0xfd..=0xffff => {
            buf[0] = 0xfd;
            LittleEndian::write_u16(&mut buf[1..3], value as u16);
            3
        }
        0x1_0000..=0xffff_ffff => {
            buf[0] = 0xfe;
            LittleEndian::write_u32(&mut buf[1..5], value as u32);
            5
        }
        _ => {
            buf[0] = 0xff;
            LittleEndian::write_u64(&mut buf[1..9], value);
            9
        }
    }
}

/// Reads a compact-size integer, returning the value and the bytes
/// consumed. Non-canonical encodings are refused.
pub fn read_varint(data: &[u8]) -> Result<(u64, usize), Error> {
    let first = *data.first().ok_or(Error::Malformed("truncated varint"))?;
    match first {
        0x00..=0xfc => Ok((u64::from(first), 1)),
        0xfd => {
            if data.len() < 3 {
                return Err(Error::Malformed("truncated varint"));
            }
            let value = u64::from(LittleEndian::read_u16(&data[1..3]));
            if value < 0xfd {
                return Err(Error::Malformed("non-canonical varint"));
            }
            Ok((value, 3))
        }
        0xfe => {
            if data.len() < 5 {
                return Err(Error::Malformed("truncated varint"));
            }
            let value = u64::from(LittleEndian::read_u32(&data[1..5]));
            if value <= 0xffff {
                return Err(Error::Malformed("non-canonical varint"));
            }
            Ok((value, 5))
        }
        0xff => {
            if data.len() < 9 {
                return Err(Error::Malformed("truncated varint"));
            }
            let value = LittleEndian::read_u64(&data[1..9]);
            if value <= 0xffff_ffff {
                return Err(Error::Malformed("non-canonical varint"));
            }
            Ok((value, 9))
        }
    }
}

/// Encoded size of a length-prefixed command string.
pub fn varstring_size(s: &str) -> usize {
    varint_size(s.len() as u64) + s.len()
}

/// Writes the length prefix and bytes of `s`, returning the bytes used.
pub fn write_varstring(buf: &mut [u8], s: &str) -> usize {
    let used = write_varint(buf, s.len() as u64);
    buf[used..used + s.len()].copy_from_slice(s.as_bytes());
    used + s.len()
}

/// Reads a length-prefixed ascii string, returning it and the bytes
/// consumed.
pub fn read_varstring(data: &[u8]) -> Result<(String, usize), Error> {
    let (len, used) = read_varint(data)?;
    if len > (data.len() - used) as u64 {
        return Err(Error::Malformed("truncated varstring"));
    }
    let len = len as usize;
    let bytes = &data[used..used + len];
    if !bytes.is_ascii() {
        return Err(Error::Malformed("non-ascii command"));
    }
    let command = String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Malformed("non-ascii command"))?;
    Ok((command, used + len))
}
