//! Network Module Implementation
//!
//! This module holds everything that touches an accepted socket: the buffered
//! frame reader, the once-close guard, the reorder buffer and the connection
//! pipeline that ties them together.
//!
//! # Components
//!
//! - `FrameReader`: reads whole frames off the socket through a [`Codec`]
//! - `OnceClose`: closes a socket or listener at most once
//! - `ReorderBuffer`: puts concurrently produced responses back in request order
//! - `ConnectionPipeline`: read -> process -> reorder -> write for one connection
//!
//! [`Codec`]: crate::Codec

pub use connection::FrameReader;
pub use once_close::{Close, OnceClose};
pub use pipeline::{ConnectionPipeline, PipelineOutcome};
pub use reorder::ReorderBuffer;

mod connection;
mod once_close;
mod pipeline;
mod reorder;
