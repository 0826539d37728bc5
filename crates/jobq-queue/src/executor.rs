//! Script execution

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// What a script returned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutput {
    pub status_code: i32,
    pub result: String,
}

impl ScriptOutput {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            result: result.into(),
        }
    }

    pub fn with_status(status_code: i32, result: impl Into<String>) -> Self {
        Self {
            status_code,
            result: result.into(),
        }
    }

    /// Only 2xx status codes count as a successful attempt
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("No script registered as '{0}'")]
    UnknownScript(String),
    #[error("Script failed: {0}")]
    Failed(String),
    #[error("Script timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Runs the script a job names
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn execute(&self, script_name: &str, args: &str) -> Result<ScriptOutput, ExecutionError>;
}

type ScriptHandler =
    Box<dyn Fn(String) -> BoxFuture<'static, Result<ScriptOutput, ExecutionError>> + Send + Sync>;

/// Executor that dispatches on script name to registered async handlers
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    handlers: Arc<RwLock<HashMap<String, ScriptHandler>>>,
}

impl std::fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ScriptRegistry")
            .field("scripts", &names)
            .finish()
    }
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; it receives the job's `args` string
    pub fn register<F, Fut>(&self, script_name: &str, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ScriptOutput, ExecutionError>> + Send + 'static,
    {
        let boxed: ScriptHandler = Box::new(move |args| Box::pin(handler(args)));
        match self.handlers.write() {
            Ok(mut handlers) => {
                handlers.insert(script_name.to_string(), boxed);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(script_name.to_string(), boxed);
            }
        }
    }

    pub fn contains(&self, script_name: &str) -> bool {
        self.handlers
            .read()
            .map(|h| h.contains_key(script_name))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ScriptExecutor for ScriptRegistry {
    async fn execute(&self, script_name: &str, args: &str) -> Result<ScriptOutput, ExecutionError> {
        let fut = {
            let handlers = self
                .handlers
                .read()
                .map_err(|_| ExecutionError::Failed("script registry lock poisoned".into()))?;
            match handlers.get(script_name) {
                Some(handler) => handler(args.to_string()),
                None => return Err(ExecutionError::UnknownScript(script_name.to_string())),
            }
        };
        fut.await
    }
}
