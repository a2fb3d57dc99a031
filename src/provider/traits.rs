//! Model provider abstraction
//!
//! Defines the trait HTTP adapters implement so the orchestrator can drive
//! any model through one interface.

use anyhow::Result;
use futures_util::Stream;
use std::pin::Pin;

use super::types::{ModelRequest, ModelResponse, StreamChunk};

/// Type alias for streaming response
pub type StreamingResponse = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Core trait that all model providers implement
///
/// # Example
///
/// ```ignore
/// use deckrun::provider::{ModelProvider, ModelRequest};
///
/// async fn ask(provider: &dyn ModelProvider, request: ModelRequest) -> anyhow::Result<()> {
///     let response = provider.generate(request).await?;
///     if let Some(text) = response.text {
///         println!("{}", text);
///     }
///     Ok(())
/// }
/// ```
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// Generate a complete response
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse>;

    /// Generate a streaming response
    ///
    /// The default implementation calls [`generate`](Self::generate) and
    /// replays the answer as a short stream.
    async fn generate_stream(&self, request: ModelRequest) -> Result<StreamingResponse> {
        let response = self.generate(request).await?;
        let mut chunks = Vec::new();
        if let Some(text) = response.text {
            chunks.push(Ok(StreamChunk::Text { delta: text }));
        }
        for (index, call) in response.tool_calls.into_iter().enumerate() {
            chunks.push(Ok(StreamChunk::ToolCallDelta {
                index,
                id: Some(call.id),
                name: Some(call.name),
                arguments_delta: Some(call.arguments),
            }));
        }
        chunks.push(Ok(StreamChunk::Done {
            status: response.status,
        }));
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    /// Whether `generate_stream` yields real incremental output
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Provider name for logging and debugging
    fn provider_name(&self) -> &str;

    /// Default model identifier for this provider
    fn default_model(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::{ResponseAccumulator, ToolCallRequest};
    use futures_util::StreamExt;

    struct Fixed;

    #[async_trait::async_trait]
    impl ModelProvider for Fixed {
        async fn generate(&self, _request: ModelRequest) -> Result<ModelResponse> {
            Ok(ModelResponse {
                text: Some("hi".into()),
                tool_calls: vec![ToolCallRequest::new("c1", "echo", "{}")],
                status: crate::provider::FinishStatus::ToolCalls,
            })
        }

        fn provider_name(&self) -> &str {
            "fixed"
        }

        fn default_model(&self) -> String {
            "fixed-1".into()
        }
    }

    #[tokio::test]
    async fn test_default_stream_replays_response() {
        let request = ModelRequest {
            run_id: "r".into(),
            model: None,
            system: None,
            history: Vec::new(),
            tools: Vec::new(),
            stream: true,
        };
        let expected = Fixed.generate(request.clone()).await.unwrap();

        let mut stream = Fixed.generate_stream(request).await.unwrap();
        let mut acc = ResponseAccumulator::new();
        while let Some(chunk) = stream.next().await {
            acc.push(&chunk.unwrap());
        }
        assert!(acc.is_done());
        assert_eq!(acc.finish(), expected);
        assert!(!Fixed.supports_streaming());
    }
}
