use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::Codec;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

const LENGTH_FIELD_SIZE: usize = 4;

/// `[i32 body length][body]`, big-endian, for requests and responses alike.
#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    max_frame_size: usize,
}

impl LengthPrefixedCodec {
    pub fn new(max_frame_size: usize) -> Self {
        LengthPrefixedCodec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Checks that `buffer` starts with a complete, acceptable frame.
    pub fn check(&self, buffer: &mut BytesMut) -> AppResult<()> {
        if buffer.remaining() < LENGTH_FIELD_SIZE {
            return Err(Incomplete);
        }
        let mut length_field = [0u8; LENGTH_FIELD_SIZE];
        length_field.copy_from_slice(&buffer[..LENGTH_FIELD_SIZE]);
        let body_size = i32::from_be_bytes(length_field);
        if body_size < 0 {
            return Err(AppError::MalformedProtocol(format!(
                "frame size {} less than 0",
                body_size
            )));
        }
        let body_size = body_size as usize;
        if body_size > self.max_frame_size {
            return Err(AppError::MalformedProtocol(format!(
                "Frame of length {} is too large.",
                body_size
            )));
        }
        if buffer.remaining() < body_size + LENGTH_FIELD_SIZE {
            buffer.reserve(body_size + LENGTH_FIELD_SIZE - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(())
    }
}

impl Codec for LengthPrefixedCodec {
    type Request = Bytes;
    type Response = Bytes;

    fn decode(&self, src: &mut BytesMut) -> AppResult<Option<Bytes>> {
        // perform a check to ensure we have enough data
        match self.check(src) {
            Ok(_) => {
                let body_length = src.get_i32() as usize;
                Ok(Some(src.split_to(body_length).freeze()))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn encode(&self, response: &Bytes, dst: &mut BytesMut) -> AppResult<()> {
        if response.len() > self.max_frame_size {
            return Err(AppError::MalformedProtocol(format!(
                "response of length {} exceeds max frame size {}",
                response.len(),
                self.max_frame_size
            )));
        }
        dst.reserve(LENGTH_FIELD_SIZE + response.len());
        dst.put_i32(response.len() as i32);
        dst.put_slice(response);
        Ok(())
    }
}
