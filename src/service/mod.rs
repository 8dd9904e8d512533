pub use app_error::{is_peer_gone, AppError, AppResult};
pub use config::{NetworkConfig, PipelineConfig, ServerConfig};
pub use registry::{
    ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionRegistry, PipelineState,
};
pub use server::{Server, ServerState};
pub use shutdown::{CancelScope, CloseCause};
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod registry;
mod server;
mod shutdown;
mod tracing_config;
