//! Method table — name → handler dispatch for bound endpoints.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

type BoxFuture = Pin<Box<dyn Future<Output = Value> + Send>>;

/// A remotely callable method. Receives the call's `args`, resolves to the
/// reply's `data`.
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture + Send + Sync>;

/// Build the `{"error": ...}` reply used when a method cannot run.
pub fn error_reply(message: impl Into<String>) -> Value {
    json!({ "error": message.into() })
}

/// Methods a bound endpoint serves.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler working on raw JSON.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |args: Value| -> BoxFuture { Box::pin(handler(args)) });
        self.methods.insert(name.into(), wrapped);
        self
    }

    /// Register a handler with typed arguments and result.
    ///
    /// Arguments that do not decode into `A` are answered with an error
    /// reply instead of reaching the handler.
    pub fn register_typed<A, R, F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let name = name.into();
        let method = name.clone();
        let handler = Arc::new(handler);

        self.register(name, move |args| {
            let handler = Arc::clone(&handler);
            let method = method.clone();
            async move {
                let args = match serde_json::from_value::<A>(args) {
                    Ok(args) => args,
                    Err(e) => {
                        warn!(%method, error = %e, "rejecting call with invalid arguments");
                        return error_reply(format!("invalid arguments for {method}: {e}"));
                    }
                };
                match serde_json::to_value(handler(args).await) {
                    Ok(data) => data,
                    Err(e) => error_reply(format!("failed to encode {method} result: {e}")),
                }
            }
        })
    }

    /// Move every method of `other` into this table.
    pub fn merge(&mut self, other: MethodTable) -> &mut Self {
        self.methods.extend(other.methods);
        self
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.methods.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
