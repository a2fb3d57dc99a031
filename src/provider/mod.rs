//! Model provider abstraction module
//!
//! The provider trait and the wire types exchanged with model adapters.
//! HTTP adapters live outside this crate and implement [`ModelProvider`].

pub mod traits;
pub mod types;

pub use traits::{ModelProvider, StreamingResponse};
pub use types::{
    FinishStatus, ModelRequest, ModelResponse, ResponseAccumulator, StreamChunk, ToolCallRequest,
    ToolDefinition,
};
