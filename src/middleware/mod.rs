//! Ordered, bidirectional wire transforms.
//!
//! A [`MiddlewarePipeline`] wraps every send and every receive on a channel.
//! Each stage sees the bytes produced by the stage before it and hands its own
//! output on through [`Next`]:
//!
//! ```text
//! send:     raw ──▶ s1 ──▶ s2 ──▶ … ──▶ sN ──▶ wire
//! receive:  raw ◀── s1 ◀── s2 ◀── … ◀── sN ◀── wire
//! ```
//!
//! Wire bytes are therefore `sN(…s2(s1(raw)))`, and the receive side applies
//! each stage's own receive transform in reverse order. Stages are not required
//! to be exact inverses; keeping them symmetric is the stage author's job.
//!
//! A stage fails the whole send/receive by returning an error instead of
//! calling `next`.
//!
//! # Usage
//!
//! ```ignore
//! let pipeline = MiddlewarePipeline::builder()
//!     .with(CompressionMiddleware::new(Some(4096)))
//!     .with(EncryptionMiddleware::new(key))
//!     .with(Base64Middleware)
//!     .build();
//! ```

pub mod compression;
pub mod encoding;
pub mod encryption;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use compression::CompressionMiddleware;
pub use encoding::Base64Middleware;
pub use encryption::EncryptionMiddleware;

/// Errors raised by a middleware stage.
#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    /// Stage declined to pass the message on.
    #[error("{stage} rejected message: {reason}")]
    Rejected {
        /// Stage name.
        stage: String,
        /// Why the message was rejected.
        reason: String,
    },

    /// Stage could not transform the payload.
    #[error("{stage} transform failed: {reason}")]
    Transform {
        /// Stage name.
        stage: String,
        /// Underlying failure.
        reason: String,
    },
}

impl MiddlewareError {
    /// Convenience constructor for transform failures.
    pub fn transform(stage: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Transform {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    /// Convenience constructor for rejections.
    pub fn rejected(stage: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Rejected {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }
}

/// One transform stage.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Short name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Transform an outgoing payload and continue with `next`.
    async fn on_send(&self, payload: Vec<u8>, next: Next<'_>) -> Result<Vec<u8>, MiddlewareError>;

    /// Transform an incoming payload and continue with `next`.
    async fn on_receive(
        &self,
        payload: Vec<u8>,
        next: Next<'_>,
    ) -> Result<Vec<u8>, MiddlewareError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Receive,
}

/// Continuation handed to a stage: the remainder of the chain.
///
/// Holds the slice of stages still to run; the terminal continuation returns
/// the payload unchanged.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    direction: Direction,
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.remaining.len())
            .field("direction", &self.direction)
            .finish()
    }
}

impl<'a> Next<'a> {
    /// Run the rest of the chain on `payload`.
    pub async fn run(self, payload: Vec<u8>) -> Result<Vec<u8>, MiddlewareError> {
        match self.direction {
            Direction::Send => match self.remaining.split_first() {
                Some((stage, rest)) => {
                    stage
                        .on_send(payload, Next::new(rest, Direction::Send))
                        .await
                }
                None => Ok(payload),
            },
            Direction::Receive => match self.remaining.split_last() {
                Some((stage, rest)) => {
                    stage
                        .on_receive(payload, Next::new(rest, Direction::Receive))
                        .await
                }
                None => Ok(payload),
            },
        }
    }

    fn new(remaining: &'a [Arc<dyn Middleware>], direction: Direction) -> Self {
        Self {
            remaining,
            direction,
        }
    }
}

/// Immutable, cheaply cloneable chain of stages.
#[derive(Clone)]
pub struct MiddlewarePipeline {
    stages: Arc<[Arc<dyn Middleware>]>,
}

impl Default for MiddlewarePipeline {
    fn default() -> Self {
        Self {
            stages: Arc::from(Vec::new()),
        }
    }
}

impl fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| s.name()))
            .finish()
    }
}

impl MiddlewarePipeline {
    /// Start building a pipeline.
    pub fn builder() -> MiddlewarePipelineBuilder {
        MiddlewarePipelineBuilder::default()
    }

    /// Pipeline with no stages (bytes pass through untouched).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Apply the outbound chain: stage 1 first, stage N produces the wire bytes.
    pub async fn run_send(&self, payload: Vec<u8>) -> Result<Vec<u8>, MiddlewareError> {
        Next::new(&self.stages, Direction::Send).run(payload).await
    }

    /// Apply the inbound chain: stage N first, stage 1 produces the raw bytes.
    pub async fn run_receive(&self, payload: Vec<u8>) -> Result<Vec<u8>, MiddlewareError> {
        Next::new(&self.stages, Direction::Receive).run(payload).await
    }
}

/// Builder for [`MiddlewarePipeline`]; registration order is chain order.
#[derive(Default)]
pub struct MiddlewarePipelineBuilder {
    stages: Vec<Arc<dyn Middleware>>,
}

impl fmt::Debug for MiddlewarePipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewarePipelineBuilder")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl MiddlewarePipelineBuilder {
    /// Append a stage.
    #[must_use]
    pub fn with(mut self, stage: impl Middleware) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Append an already shared stage.
    #[must_use]
    pub fn with_shared(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Freeze the chain.
    pub fn build(self) -> MiddlewarePipeline {
        MiddlewarePipeline {
            stages: self.stages.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Prepends its tag on send, strips it on receive.
    struct Tag(&'static str);

    #[async_trait]
    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn on_send(&self, payload: Vec<u8>, next: Next<'_>) -> Result<Vec<u8>, MiddlewareError> {
            let mut tagged = self.0.as_bytes().to_vec();
            tagged.extend_from_slice(&payload);
            next.run(tagged).await
        }

        async fn on_receive(
            &self,
            payload: Vec<u8>,
            next: Next<'_>,
        ) -> Result<Vec<u8>, MiddlewareError> {
            let Some(rest) = payload.strip_prefix(self.0.as_bytes()) else {
                return Err(MiddlewareError::rejected(self.0, "missing tag"));
            };
            next.run(rest.to_vec()).await
        }
    }

    /// Fails every send without calling `next`.
    struct Refuse;

    #[async_trait]
    impl Middleware for Refuse {
        fn name(&self) -> &'static str {
            "refuse"
        }

        async fn on_send(&self, _payload: Vec<u8>, _next: Next<'_>) -> Result<Vec<u8>, MiddlewareError> {
            Err(MiddlewareError::rejected("refuse", "not today"))
        }

        async fn on_receive(
            &self,
            payload: Vec<u8>,
            next: Next<'_>,
        ) -> Result<Vec<u8>, MiddlewareError> {
            next.run(payload).await
        }
    }

    fn tagged_pipeline() -> MiddlewarePipeline {
        MiddlewarePipeline::builder()
            .with(Tag("A:"))
            .with(Tag("B:"))
            .with(Tag("C:"))
            .build()
    }

    #[tokio::test]
    async fn test_send_applies_stages_in_registration_order() {
        let wire = tagged_pipeline().run_send(b"x".to_vec()).await.unwrap();
        assert_eq!(wire, b"C:B:A:x");
    }

    #[tokio::test]
    async fn test_receive_applies_stages_in_reverse_order() {
        let raw = tagged_pipeline()
            .run_receive(b"C:B:A:x".to_vec())
            .await
            .unwrap();
        assert_eq!(raw, b"x");
    }

    #[tokio::test]
    async fn test_receive_with_wrong_order_fails() {
        let err = tagged_pipeline()
            .run_receive(b"A:B:C:x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, MiddlewareError::Rejected { ref stage, .. } if stage == "C:"));
    }

    #[tokio::test]
    async fn test_empty_pipeline_passes_through() {
        let pipeline = MiddlewarePipeline::empty();
        assert!(pipeline.is_empty());
        assert_eq!(pipeline.run_send(b"raw".to_vec()).await.unwrap(), b"raw");
        assert_eq!(pipeline.run_receive(b"raw".to_vec()).await.unwrap(), b"raw");
    }

    #[tokio::test]
    async fn test_stage_can_terminate_chain() {
        let pipeline = MiddlewarePipeline::builder()
            .with(Tag("A:"))
            .with(Refuse)
            .with(Tag("C:"))
            .build();
        let err = pipeline.run_send(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, MiddlewareError::Rejected { .. }));
    }
}
