use std::future::Future;
use std::net::SocketAddr;

use crate::AppResult;

pub use hello::HelloHandler;

mod hello;

/// One decoded request, stamped by the read stage of its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<P> {
    /// Position of the request on its connection, starting at 0.
    pub sequence: u64,
    pub remote_addr: SocketAddr,
    pub payload: P,
}

/// The reply to the request with the same sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<P> {
    pub sequence: u64,
    pub payload: P,
}

/// Business logic of the broker: turns a request into a response payload.
///
/// Invocations for the same connection run concurrently; the pipeline puts
/// their responses back in request order. An `Err` is logged and no response
/// is sent for that request, the connection stays open.
pub trait Handler: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn handle(
        &self,
        request: Request<Self::Request>,
    ) -> impl Future<Output = AppResult<Self::Response>> + Send;
}
