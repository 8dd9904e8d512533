use std::io::{self, ErrorKind};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::Codec;
use crate::AppResult;

/// The read side of a client connection.
///
/// Wraps the socket's read half with a growable buffer so that frames split
/// across several TCP segments, or several frames packed into one segment, are
/// handed to the codec one at a time.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, buffer_size: usize) -> FrameReader<R> {
        FrameReader {
            reader,
            buffer: BytesMut::with_capacity(buffer_size),
        }
    }

    /// Reads one request from the connection.
    ///
    /// This method continuously reads data from the stream into the buffer until a complete
    /// request can be decoded. If a data format error is encountered, or if the packet
    /// exceeds the size limit, an error is returned and the connection should be closed.
    ///
    /// If the client closes the connection while a frame is being sent, an error is returned.
    /// If the client closes the connection gracefully, `None` is returned.
    pub async fn read_frame<C: Codec>(&mut self, codec: &C) -> AppResult<Option<C::Request>> {
        loop {
            if let Some(request) = codec.decode(&mut self.buffer)? {
                return Ok(Some(request));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    // client has closed the connection gracefully
                    Ok(None)
                } else {
                    // client close the connection while sending a frame
                    Err(io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer").into())
                };
            }
        }
    }
}
