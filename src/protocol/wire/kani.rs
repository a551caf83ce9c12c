//! Kani harnesses for the varint codec.

use bytes::BytesMut;

use super::{MAX_VARINT_LEN, read_varint_u64, write_varint_u64, zigzag_decode, zigzag_encode};

#[kani::proof]
fn kani_zigzag_roundtrips() {
    let value: i64 = kani::any();
    kani::assert(
        zigzag_decode(zigzag_encode(value)) == value,
        "zigzag decode inverts encode",
    );
}

#[kani::proof]
fn kani_varint_u64_roundtrips() {
    let value: u64 = kani::any();
    let mut buf = BytesMut::new();
    write_varint_u64(&mut buf, value);
    kani::assert(
        buf.len() <= MAX_VARINT_LEN,
        "encoded varint fits the length bound",
    );
    let mut view = buf.freeze();
    let decoded = read_varint_u64(&mut view);
    kani::assert(
        matches!(decoded, Ok(got) if got == value),
        "varint decode inverts encode",
    );
}
