//! Low-level helpers shared by the BASS decoders and encoders.
//!
//! All multi-octet integers in BASS are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Fail with [`ProtocolError::Truncated`] unless `needed` bytes remain.
pub(crate) fn ensure(buf: &Bytes, field: &'static str, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes, field: &'static str) -> Result<u8, ProtocolError> {
    ensure(buf, field, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u24_le(buf: &mut Bytes, field: &'static str) -> Result<u32, ProtocolError> {
    ensure(buf, field, 3)?;
    let lo = buf.get_u16_le() as u32;
    let hi = buf.get_u8() as u32;
    Ok(lo | (hi << 16))
}

pub(crate) fn get_array<const N: usize>(
    buf: &mut Bytes,
    field: &'static str,
) -> Result<[u8; N], ProtocolError> {
    ensure(buf, field, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Read a one-octet length followed by that many bytes.
pub(crate) fn get_length_prefixed(
    buf: &mut Bytes,
    length_field: &'static str,
    field: &'static str,
) -> Result<Bytes, ProtocolError> {
    let declared = get_u8(buf, length_field)? as usize;
    if declared > buf.remaining() {
        return Err(ProtocolError::LengthOverrun {
            field,
            declared,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.split_to(declared))
}

pub(crate) fn put_u24_le(buf: &mut BytesMut, value: u32) {
    buf.put_u16_le((value & 0xFFFF) as u16);
    buf.put_u8(((value >> 16) & 0xFF) as u8);
}

/// Write a one-octet length followed by the bytes.
pub(crate) fn put_length_prefixed(
    buf: &mut BytesMut,
    field: &'static str,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let len = u8::try_from(data.len()).map_err(|_| ProtocolError::InvalidValue {
        field,
        value: data.len() as u32,
    })?;
    buf.put_u8(len);
    buf.put_slice(data);
    Ok(())
}
