use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{
    AmqpFrame, ContentHeader, FRAME_BODY, FRAME_END, FRAME_HEADER, FRAME_HEARTBEAT, FRAME_METHOD,
    Method,
};

/// Largest frame this client accepts or offers during tuning.
pub const MAX_FRAME_SIZE: u32 = 131_072;

/// type + channel + size
const FRAME_PREFIX: usize = 7;

/// `AmqpCodec` implements `tokio_util::codec::{Decoder, Encoder}` for AMQP
/// 0-9-1 frames.
///
/// The protocol header is not a frame and is written to the socket before
/// the codec takes over.
#[derive(Debug)]
pub struct AmqpCodec {
    max_frame: usize,
}

impl AmqpCodec {
    pub fn new() -> Self {
        Self {
            max_frame: MAX_FRAME_SIZE as usize,
        }
    }
}

impl Default for AmqpCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Decoder for AmqpCodec {
    type Item = AmqpFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_PREFIX {
            return Ok(None);
        }
        let kind = src[0];
        let channel = u16::from_be_bytes([src[1], src[2]]);
        let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        if size > self.max_frame {
            return Err(invalid(format!(
                "frame of {} bytes exceeds limit of {}",
                size, self.max_frame
            )));
        }

        let total = FRAME_PREFIX + size + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(total);
        if raw[total - 1] != FRAME_END {
            return Err(invalid(format!(
                "bad frame end 0x{:02x}, expected 0x{:02x}",
                raw[total - 1],
                FRAME_END
            )));
        }
        raw.advance(FRAME_PREFIX);
        raw.truncate(size);
        let payload = raw.freeze();

        let frame = match kind {
            FRAME_METHOD => AmqpFrame::Method(channel, Method::decode(&payload)?),
            FRAME_HEADER => AmqpFrame::Header(channel, ContentHeader::decode(&payload)?),
            FRAME_BODY => AmqpFrame::Body(channel, payload),
            FRAME_HEARTBEAT => AmqpFrame::Heartbeat,
            other => return Err(invalid(format!("unknown frame type {}", other))),
        };
        Ok(Some(frame))
    }
}

impl Encoder<AmqpFrame> for AmqpCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: AmqpFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, channel) = match &frame {
            AmqpFrame::Method(ch, _) => (FRAME_METHOD, *ch),
            AmqpFrame::Header(ch, _) => (FRAME_HEADER, *ch),
            AmqpFrame::Body(ch, _) => (FRAME_BODY, *ch),
            AmqpFrame::Heartbeat => (FRAME_HEARTBEAT, 0),
        };

        let start = dst.len();
        dst.put_u8(kind);
        dst.put_u16(channel);
        dst.put_u32(0);
        match &frame {
            AmqpFrame::Method(_, method) => method.encode(dst)?,
            AmqpFrame::Header(_, header) => header.encode(dst)?,
            AmqpFrame::Body(_, body) => dst.extend_from_slice(body),
            AmqpFrame::Heartbeat => {}
        }
        let size = dst.len() - start - FRAME_PREFIX;
        if size > self.max_frame {
            dst.truncate(start);
            return Err(invalid(format!(
                "frame of {} bytes exceeds limit of {}",
                size, self.max_frame
            )));
        }
        dst[start + 3..start + FRAME_PREFIX].copy_from_slice(&(size as u32).to_be_bytes());
        dst.put_u8(FRAME_END);
        Ok(())
    }
}
