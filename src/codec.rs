use bytes::{Buf, BytesMut};
use std::convert::TryInto;
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::frame::{self, Frame};
use crate::Error;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Streams RESP frames in and commands out.
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        let frame = match Frame::parse_bounded(&mut cursor, self.max_frame_size) {
            Ok(frame) => frame,
            Err(frame::Error::Incomplete) => {
                // Not enough data to parse a frame, refuse to buffer past the limit.
                if src.len() > self.max_frame_size {
                    return Err(frame::Error::TooLarge(src.len()).into());
                }
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let position: usize = cursor
            .position()
            .try_into()
            .map_err(|_| frame::Error::TooLarge(src.len()))?;

        // Remove the parsed frame from the buffer.
        src.advance(position);

        Ok(Some(frame))
    }
}

impl<'a> Encoder<&'a Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, command: &'a Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        command.encode_into(dst);
        Ok(())
    }
}
