//! Variable-length integer and length-prefixed wire primitives.
//!
//! All multi-byte integers on the wire are LEB128 varints; signed values are
//! zigzag-mapped first so small negative numbers stay short. Strings and
//! byte slices are length-prefixed with a varint. Readers are checked: they
//! never read past the bytes declared valid and report [`ProtocolError::ShortBuffer`]
//! when the input runs out.

use bytes::{Buf, BufMut, Bytes};

use super::errors::ProtocolError;

/// Maximum encoded length of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Write an unsigned 64-bit varint.
#[expect(
    clippy::cast_possible_truncation,
    reason = "the value is masked to its low seven bits before the cast"
)]
pub fn write_varint_u64(buf: &mut impl BufMut, value: u64) {
    let mut rest = value;
    while rest >= 0x80 {
        buf.put_u8((rest & 0x7F) as u8 | 0x80);
        rest >>= 7;
    }
    buf.put_u8(rest as u8);
}

/// Read an unsigned 64-bit varint.
///
/// # Errors
/// Returns [`ProtocolError::ShortBuffer`] if the buffer runs out before the
/// varint terminates, or [`ProtocolError::VarintOverflow`] if the encoding
/// does not fit in 64 bits.
pub fn read_varint_u64(buf: &mut impl Buf) -> Result<u64, ProtocolError> {
    let mut value: u64 = 0;
    for group in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(ProtocolError::ShortBuffer);
        }
        let byte = buf.get_u8();
        let low = u64::from(byte & 0x7F);
        // The tenth byte may only carry the final bit of a 64-bit value.
        if group == MAX_VARINT_LEN - 1 && low > 1 {
            return Err(ProtocolError::VarintOverflow);
        }
        value |= low << (group * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::VarintOverflow)
}

/// Map a signed value onto the unsigned varint domain.
#[expect(
    clippy::cast_sign_loss,
    reason = "zigzag is a bit-pattern conversion"
)]
#[must_use]
pub const fn zigzag_encode(value: i64) -> u64 { ((value << 1) ^ (value >> 63)) as u64 }

/// Invert [`zigzag_encode`].
#[expect(
    clippy::cast_possible_wrap,
    reason = "zigzag is a bit-pattern conversion"
)]
#[must_use]
pub const fn zigzag_decode(value: u64) -> i64 { ((value >> 1) as i64) ^ -((value & 1) as i64) }

/// Write a signed 64-bit value as a zigzag varint.
pub fn write_varint_i64(buf: &mut impl BufMut, value: i64) {
    write_varint_u64(buf, zigzag_encode(value));
}

/// Read a signed 64-bit zigzag varint.
///
/// # Errors
/// Propagates the failures of [`read_varint_u64`].
pub fn read_varint_i64(buf: &mut impl Buf) -> Result<i64, ProtocolError> {
    read_varint_u64(buf).map(zigzag_decode)
}

/// Write a signed 32-bit value as a zigzag varint.
pub fn write_varint_i32(buf: &mut impl BufMut, value: i32) {
    write_varint_i64(buf, i64::from(value));
}

/// Read a signed 32-bit zigzag varint.
///
/// # Errors
/// Returns [`ProtocolError::LengthOutOfRange`] if the decoded value does not
/// fit in an `i32`, plus the failures of [`read_varint_u64`].
pub fn read_varint_i32(buf: &mut impl Buf) -> Result<i32, ProtocolError> {
    let wide = read_varint_i64(buf)?;
    i32::try_from(wide).map_err(|_| ProtocolError::LengthOutOfRange(zigzag_encode(wide)))
}

/// Write a length or count field.
#[expect(
    clippy::cast_possible_truncation,
    reason = "usize always fits in u64 on supported targets"
)]
pub fn write_len(buf: &mut impl BufMut, len: usize) { write_varint_u64(buf, len as u64) }

/// Read a length or count field into a `usize`.
///
/// # Errors
/// Returns [`ProtocolError::LengthOutOfRange`] for values beyond `u32::MAX`,
/// plus the failures of [`read_varint_u64`].
pub fn read_len(buf: &mut impl Buf) -> Result<usize, ProtocolError> {
    let wide = read_varint_u64(buf)?;
    let narrow = u32::try_from(wide).map_err(|_| ProtocolError::LengthOutOfRange(wide))?;
    usize::try_from(narrow).map_err(|_| ProtocolError::LengthOutOfRange(wide))
}

/// Read a single byte.
///
/// # Errors
/// Returns [`ProtocolError::ShortBuffer`] if the buffer is empty.
pub fn read_u8(buf: &mut impl Buf) -> Result<u8, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::ShortBuffer);
    }
    Ok(buf.get_u8())
}

/// Write a double as its 8-byte big-endian IEEE-754 bit pattern.
pub fn write_f64(buf: &mut impl BufMut, value: f64) { buf.put_f64(value) }

/// Read a big-endian double.
///
/// # Errors
/// Returns [`ProtocolError::ShortBuffer`] if fewer than eight bytes remain.
pub fn read_f64(buf: &mut impl Buf) -> Result<f64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::ShortBuffer);
    }
    Ok(buf.get_f64())
}

/// Write a length-prefixed byte slice.
pub fn write_bytes(buf: &mut impl BufMut, value: &[u8]) {
    write_len(buf, value.len());
    buf.put_slice(value);
}

/// Read a length-prefixed byte slice.
///
/// # Errors
/// Returns [`ProtocolError::ShortBuffer`] if fewer bytes remain than the
/// prefix declares, plus the failures of [`read_len`].
pub fn read_bytes(buf: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    let len = read_len(buf)?;
    if buf.remaining() < len {
        return Err(ProtocolError::ShortBuffer);
    }
    Ok(buf.copy_to_bytes(len))
}

/// Write a length-prefixed UTF-8 string.
pub fn write_str(buf: &mut impl BufMut, value: &str) { write_bytes(buf, value.as_bytes()) }

/// Read a length-prefixed UTF-8 string.
///
/// # Errors
/// Returns [`ProtocolError::InvalidUtf8`] for malformed text, plus the
/// failures of [`read_bytes`].
pub fn read_str(buf: &mut impl Buf) -> Result<String, ProtocolError> {
    let raw = read_bytes(buf)?;
    std::str::from_utf8(&raw)
        .map(ToOwned::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

#[cfg(kani)]
mod kani;

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(127, 1)]
    #[case(128, 2)]
    #[case(16_383, 2)]
    #[case(16_384, 3)]
    #[case(u64::from(u32::MAX), 5)]
    #[case(u64::MAX, 10)]
    fn varint_u64_roundtrips(#[case] value: u64, #[case] encoded_len: usize) {
        let mut buf = BytesMut::new();
        write_varint_u64(&mut buf, value);
        assert_eq!(buf.len(), encoded_len);

        let mut view = buf.freeze();
        assert_eq!(read_varint_u64(&mut view).expect("decode"), value);
        assert!(!view.has_remaining());
    }

    #[rstest]
    #[case(0)]
    #[case(-1)]
    #[case(1)]
    #[case(i64::MIN)]
    #[case(i64::MAX)]
    fn zigzag_roundtrips(#[case] value: i64) {
        assert_eq!(zigzag_decode(zigzag_encode(value)), value);
    }

    #[rstest]
    fn small_negatives_encode_short() {
        let mut buf = BytesMut::new();
        write_varint_i64(&mut buf, -3);
        assert_eq!(buf.len(), 1);
    }

    #[rstest]
    fn truncated_varint_reports_short_buffer() {
        let mut view = Bytes::from_static(&[0x80, 0x80]);
        assert!(matches!(
            read_varint_u64(&mut view),
            Err(ProtocolError::ShortBuffer)
        ));
    }

    #[rstest]
    fn overlong_varint_reports_overflow() {
        let mut view = Bytes::from_static(&[0xFF; 11]);
        assert!(matches!(
            read_varint_u64(&mut view),
            Err(ProtocolError::VarintOverflow)
        ));
    }

    #[rstest]
    fn tenth_byte_may_only_carry_one_bit() {
        let mut view = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x02]);
        assert!(matches!(
            read_varint_u64(&mut view),
            Err(ProtocolError::VarintOverflow)
        ));
    }

    #[rstest]
    fn strings_roundtrip() {
        let mut buf = BytesMut::new();
        write_str(&mut buf, "tick-data");
        let mut view = buf.freeze();
        assert_eq!(read_str(&mut view).expect("decode"), "tick-data");
    }

    #[rstest]
    fn invalid_utf8_is_rejected() {
        let mut buf = BytesMut::new();
        write_bytes(&mut buf, &[0xC0, 0x80]);
        let mut view = buf.freeze();
        assert!(matches!(read_str(&mut view), Err(ProtocolError::InvalidUtf8)));
    }

    #[rstest]
    fn byte_slice_length_is_validated() {
        let mut buf = BytesMut::new();
        write_len(&mut buf, 16);
        buf.extend_from_slice(&[0u8; 4]);
        let mut view = buf.freeze();
        assert!(matches!(read_bytes(&mut view), Err(ProtocolError::ShortBuffer)));
    }

    #[rstest]
    fn doubles_roundtrip() {
        let mut buf = BytesMut::new();
        write_f64(&mut buf, 42.5);
        let mut view = buf.freeze();
        let decoded = read_f64(&mut view).expect("decode");
        assert_eq!(decoded.to_bits(), 42.5f64.to_bits());
    }
}
