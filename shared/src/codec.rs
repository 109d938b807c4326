//! Stream framing for the control connection.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::protocol::{
    Flags, Frame, ProtoMsg, HEADER_LEN, MAGIC, MAX_FRAME_LENGTH, PREFIX_LEN, PROTOCOL_VERSION,
};
use crate::{Error, Result};

/// Length-field framer for [`Frame`]s.
///
/// Header problems (magic, version, length) are returned as `Decoder::Error` and end the
/// stream. A frame that is complete but whose body does not parse is consumed and yielded as
/// `Some(Err(..))`, so the next frame can still be read.
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_frame_length: usize,
}

impl WireCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = Result<Frame>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        if src[0] != MAGIC {
            return Err(Error::protocol(format!("bad magic 0x{:02x}", src[0])));
        }
        if src[1] != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "unsupported protocol version {}",
                src[1]
            )));
        }

        let total_len =
            u32::from_be_bytes([src[PREFIX_LEN], src[4], src[5], src[6]]) as usize;
        if total_len == 0 {
            return Err(Error::protocol("zero-length frame"));
        }
        if total_len > self.max_frame_length {
            return Err(Error::FrameTooLarge {
                len: total_len,
                max: self.max_frame_length,
            });
        }

        if src.len() < HEADER_LEN + total_len {
            src.reserve(HEADER_LEN + total_len - src.len());
            return Ok(None);
        }

        let flags = Flags::from_bits(src[2]);
        src.advance(HEADER_LEN);
        let mut body = src.split_to(total_len).freeze();
        let msg_type = body.get_u8();
        trace!(msg_type, len = total_len, "decoded frame");

        Ok(Some(
            ProtoMsg::decode(msg_type, body).map(|msg| Frame::new(flags, msg)),
        ))
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let total_len = frame.msg.size();
        if total_len > self.max_frame_length {
            return Err(Error::FrameTooLarge {
                len: total_len,
                max: self.max_frame_length,
            });
        }

        dst.reserve(HEADER_LEN + total_len);
        dst.put_u8(MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(frame.flags.bits());
        dst.put_u32(total_len as u32);
        frame.msg.encode_into(dst);
        Ok(())
    }
}
