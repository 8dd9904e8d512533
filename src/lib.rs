mod network;
mod protocol;
mod request;
mod service;

pub use network::{Close, ConnectionPipeline, FrameReader, OnceClose, PipelineOutcome, ReorderBuffer};
pub use protocol::{Codec, LengthPrefixedCodec};
pub use request::{Handler, HelloHandler, Request, Response};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, CancelScope, CloseCause,
    ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionRegistry, NetworkConfig,
    PipelineConfig, PipelineState, Server, ServerConfig, ServerState, TracingGuard,
};
