use bytes::Bytes;
use tracing::debug;

use super::{Handler, Request};
use crate::{AppError, AppResult};

/// Greets whoever is on the other end: `"A"` is answered with `"Hello A!"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloHandler;

impl Handler for HelloHandler {
    type Request = Bytes;
    type Response = Bytes;

    async fn handle(&self, request: Request<Bytes>) -> AppResult<Bytes> {
        debug!(
            "processing request {} from {}",
            request.sequence, request.remote_addr
        );
        let name = std::str::from_utf8(&request.payload).map_err(|e| {
            AppError::Handler(format!("request {} is not utf-8: {}", request.sequence, e))
        })?;
        Ok(Bytes::from(format!("Hello {}!", name)))
    }
}
