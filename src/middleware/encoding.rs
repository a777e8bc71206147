//! Base64 text encoding stage.
//!
//! Place it last in a pipeline that produces binary bytes (encryption,
//! compression) so the wire stays text-safe.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::{Middleware, MiddlewareError, Next};

/// Standard-alphabet base64 encoding of the whole payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Middleware;

#[async_trait]
impl Middleware for Base64Middleware {
    fn name(&self) -> &'static str {
        "base64"
    }

    async fn on_send(&self, payload: Vec<u8>, next: Next<'_>) -> Result<Vec<u8>, MiddlewareError> {
        next.run(STANDARD.encode(payload).into_bytes()).await
    }

    async fn on_receive(
        &self,
        payload: Vec<u8>,
        next: Next<'_>,
    ) -> Result<Vec<u8>, MiddlewareError> {
        let decoded = STANDARD
            .decode(&payload)
            .map_err(|e| MiddlewareError::transform("base64", e))?;
        next.run(decoded).await
    }
}
