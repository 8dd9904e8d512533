//! Wire framing.
//!
//! The connection pipeline never looks inside a frame; it hands the buffered
//! bytes of a socket to a [`Codec`] and gets whole requests back, and asks the
//! same codec to turn responses into bytes.
//!
//! [`LengthPrefixedCodec`] is the framing the broker ships with: a 4-byte
//! big-endian body length followed by the body, in both directions.

use bytes::BytesMut;

use crate::AppResult;

pub use frame::LengthPrefixedCodec;

mod frame;

pub trait Codec: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Decodes one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame, leaving
    /// it untouched. On success exactly the frame's bytes are consumed. A frame
    /// that can never become valid is an [`AppError::MalformedProtocol`].
    ///
    /// [`AppError::MalformedProtocol`]: crate::AppError::MalformedProtocol
    fn decode(&self, src: &mut BytesMut) -> AppResult<Option<Self::Request>>;

    /// Appends the wire form of `response` to `dst`. Performs no I/O.
    fn encode(&self, response: &Self::Response, dst: &mut BytesMut) -> AppResult<()>;
}
