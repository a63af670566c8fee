//! Varint encoding/decoding utilities for B-tree
//!
//! A varint is 1-9 bytes. The first eight bytes carry seven value bits
//! each with the high bit set on every byte but the last; a ninth byte, if
//! present, contributes all eight of its bits.

use crate::error::{Error, ErrorCode, Result};

/// Largest encoded size of a varint
pub const MAX_VARINT_LEN: usize = 9;

/// Decode a varint from the start of `data`.
///
/// Returns `None` when the buffer ends before a terminating byte.
pub fn decode_varint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let b = *data.get(i)?;
        if i == 8 {
            // 9th byte uses all 8 bits
            return Some(((value << 8) | b as u64, 9));
        }
        value = (value << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Read a varint from the given offset in a byte slice
pub fn read_varint(data: &[u8], offset: usize) -> Result<(u64, usize)> {
    let tail = data.get(offset..).ok_or(Error::with_message(
        ErrorCode::Corrupt,
        format!("varint offset {} past end of page", offset),
    ))?;
    decode_varint(tail).ok_or(Error::with_message(
        ErrorCode::Corrupt,
        format!("truncated varint at offset {}", offset),
    ))
}

/// Read a varint that must fit in 32 bits (payload sizes)
pub fn read_varint32(data: &[u8], offset: usize) -> Result<(u32, usize)> {
    let (val, consumed) = read_varint(data, offset)?;
    let val = u32::try_from(val).map_err(|_| {
        Error::with_message(
            ErrorCode::Corrupt,
            format!("size {} at offset {} exceeds 32 bits", val, offset),
        )
    })?;
    Ok((val, consumed))
}

/// Calculate the number of bytes needed to encode a varint
pub fn varint_len(value: u64) -> usize {
    if value <= 0x7f {
        1
    } else if value <= 0x3fff {
        2
    } else if value <= 0x1f_ffff {
        3
    } else if value <= 0x0fff_ffff {
        4
    } else if value <= 0x07_ffff_ffff {
        5
    } else if value <= 0x03ff_ffff_ffff {
        6
    } else if value <= 0x01_ffff_ffff_ffff {
        7
    } else if value <= 0x00ff_ffff_ffff_ffff {
        8
    } else {
        9
    }
}

/// Write a varint at the start of a buffer, returns bytes written
/// (0 if the buffer is too short)
pub fn put_varint(buf: &mut [u8], value: u64) -> usize {
    let len = varint_len(value);
    if buf.len() < len {
        return 0;
    }
    if len == 9 {
        buf[8] = (value & 0xFF) as u8;
        let mut v = value >> 8;
        for i in (0..8).rev() {
            buf[i] = ((v & 0x7F) | 0x80) as u8;
            v >>= 7;
        }
    } else {
        let mut v = value;
        for i in (0..len).rev() {
            if i == len - 1 {
                buf[i] = (v & 0x7F) as u8;
            } else {
                buf[i] = ((v & 0x7F) | 0x80) as u8;
            }
            v >>= 7;
        }
    }
    len
}

/// Append a varint to a Vec
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let len = put_varint(&mut buf, value);
    out.extend_from_slice(&buf[..len]);
}

/// Read a u16 from a byte slice at the given offset
pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a u32 from a byte slice at the given offset
pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a u16, reporting an out-of-range offset as corruption
pub fn get_u16(data: &[u8], offset: usize) -> Result<u16> {
    read_u16(data, offset).ok_or(Error::with_message(
        ErrorCode::Corrupt,
        format!("u16 read at offset {} past end of page", offset),
    ))
}

/// Read a u32, reporting an out-of-range offset as corruption
pub fn get_u32(data: &[u8], offset: usize) -> Result<u32> {
    read_u32(data, offset).ok_or(Error::with_message(
        ErrorCode::Corrupt,
        format!("u32 read at offset {} past end of page", offset),
    ))
}

/// Write a u32 to a byte slice at the given offset
pub fn write_u32(data: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let end = offset.checked_add(4).ok_or(Error::new(ErrorCode::Corrupt))?;
    let dst = data
        .get_mut(offset..end)
        .ok_or(Error::new(ErrorCode::Corrupt))?;
    dst.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Write a u16 to a byte slice at the given offset
pub fn write_u16(data: &mut [u8], offset: usize, value: u16) -> Result<()> {
    let end = offset.checked_add(2).ok_or(Error::new(ErrorCode::Corrupt))?;
    let dst = data
        .get_mut(offset..end)
        .ok_or(Error::new(ErrorCode::Corrupt))?;
    dst.copy_from_slice(&value.to_be_bytes());
    Ok(())
}
