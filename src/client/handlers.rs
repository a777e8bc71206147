//! Handlers for server-initiated invocations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{FromArguments, ProtocolError};

type HandlerCall = BoxFuture<'static, anyhow::Result<Value>>;
type MethodHandler = Arc<dyn Fn(Vec<Value>) -> Result<HandlerCall, ProtocolError> + Send + Sync>;
type TextHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Client-side method table. Registering a name twice replaces the handler.
#[derive(Default)]
pub(crate) struct HandlerTable {
    methods: RwLock<HashMap<String, MethodHandler>>,
    text: RwLock<Option<TextHandler>>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods = self.methods.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HandlerTable")
            .field("methods", &methods.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl HandlerTable {
    pub(crate) fn insert<A, R, F, Fut>(&self, method: &str, handler: F)
    where
        A: FromArguments,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(
            move |arguments: Vec<Value>| -> Result<HandlerCall, ProtocolError> {
                let params = A::from_arguments(arguments)?;
                let call = handler(params);
                Ok(async move {
                    let result = call.await?;
                    anyhow::Ok(serde_json::to_value(result)?)
                }
                .boxed())
            },
        );
        let replaced = self
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), handler);
        if replaced.is_some() {
            log::debug!("[Client] replaced handler for '{method}'");
        }
    }

    pub(crate) fn set_text<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self.text.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Decode `arguments` for `method`. `None` when no handler is registered.
    pub(crate) fn bind(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Option<Result<HandlerCall, ProtocolError>> {
        let handler = self
            .methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()?;
        Some(handler(arguments))
    }

    pub(crate) fn text(&self) -> Option<TextHandler> {
        self.text
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
