//! Tokio codec for the message envelope.
//!
//! Frames are `op: u8 | flags: u8 | len: varint | payload`. The decoder is
//! tolerant of partial reads: until a whole frame is buffered it returns
//! `None` and reserves space for the remainder, so it can sit directly under
//! [`tokio_util::codec::Framed`] on a TCP stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    MAX_PAYLOAD_SIZE,
    errors::ProtocolError,
    msg::{Msg, MsgFlags, MsgHeader, OpCode},
    wire::{read_len, write_len},
};

/// Codec translating between raw bytes and [`Msg`] values.
#[derive(Debug)]
pub struct MsgCodec {
    max_payload: usize,
}

impl MsgCodec {
    /// Create a codec with the default payload limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Override the maximum accepted payload size.
    #[must_use]
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

impl Default for MsgCodec {
    fn default() -> Self { Self::new() }
}

impl Decoder for MsgCodec {
    type Error = ProtocolError;
    type Item = Msg;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Parse the header on a borrowed view so nothing is consumed until
        // the whole frame is known to be buffered.
        let mut view: &[u8] = src.as_ref();
        let before = view.len();

        let (header, payload_len) = match decode_header(&mut view) {
            Ok(parts) => parts,
            Err(ProtocolError::ShortBuffer) => return Ok(None),
            Err(err) => return Err(err),
        };
        if payload_len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }

        let header_len = before - view.len();
        let frame_len = header_len + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Msg { header, payload }))
    }
}

impl Encoder<Msg> for MsgCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Msg, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge(item.payload.len()));
        }
        dst.reserve(2 + item.payload.len());
        dst.put_u8(item.header.op.as_u8());
        dst.put_u8(item.header.flags.bits());
        write_len(dst, item.payload.len());
        dst.put_slice(&item.payload);
        Ok(())
    }
}

fn decode_header(view: &mut &[u8]) -> Result<(MsgHeader, usize), ProtocolError> {
    if view.len() < 2 {
        return Err(ProtocolError::ShortBuffer);
    }
    let op = OpCode::from_u8(view.get_u8())?;
    let flags = MsgFlags::from_bits_truncate(view.get_u8());
    let payload_len = read_len(view)?;
    Ok((MsgHeader { op, flags }, payload_len))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn encoded(msg: &Msg) -> BytesMut {
        let mut codec = MsgCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).expect("encode");
        buf
    }

    #[rstest]
    fn frames_roundtrip() {
        let msg = Msg::query("metrics", "SELECT * FROM trades;");
        let mut buf = encoded(&msg);

        let mut codec = MsgCodec::new();
        let decoded = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[rstest]
    fn partial_header_yields_none_without_consuming() {
        let mut codec = MsgCodec::new();
        let mut buf = BytesMut::from(&[OpCode::Query.as_u8()][..]);

        let result = codec.decode(&mut buf).expect("decode");

        assert!(result.is_none());
        assert_eq!(buf.len(), 1);
    }

    #[rstest]
    fn partial_payload_yields_none_without_consuming() {
        let msg = Msg::query("metrics", "SELECT * FROM trades;");
        let full = encoded(&msg);
        let mut buf = full.clone();
        let tail = buf.split_off(buf.len() - 4);

        let mut codec = MsgCodec::new();
        assert!(codec.decode(&mut buf).expect("decode").is_none());

        buf.extend_from_slice(&tail);
        let decoded = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(decoded, msg);
    }

    #[rstest]
    fn byte_at_a_time_feed_decodes_one_frame() {
        let msg = Msg::error_response(7, "bad series");
        let full = encoded(&msg);

        let mut codec = MsgCodec::new();
        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in full {
            buf.put_u8(byte);
            if let Some(frame) = codec.decode(&mut buf).expect("decode") {
                decoded = Some(frame);
            }
        }
        assert_eq!(decoded.expect("frame"), msg);
    }

    #[rstest]
    fn oversized_payload_is_rejected_by_both_directions() {
        let msg = Msg::data_chunk(bytes::Bytes::from(vec![0u8; 64]));

        let mut small = MsgCodec::new().with_max_payload(16);
        let mut buf = BytesMut::new();
        assert!(matches!(
            small.encode(msg.clone(), &mut buf),
            Err(ProtocolError::PayloadTooLarge(64))
        ));

        let full = encoded(&msg);
        let mut inbound = BytesMut::from(&full[..]);
        assert!(matches!(
            small.decode(&mut inbound),
            Err(ProtocolError::PayloadTooLarge(64))
        ));
    }

    #[rstest]
    fn invalid_opcode_fails_decode() {
        let mut codec = MsgCodec::new();
        let mut buf = BytesMut::from(&[0x7E, 0x00, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidOpCode(0x7E))
        ));
    }
}
