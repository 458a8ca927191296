//! Node type registry
//!
//! Maps step type strings to the executors that perform them. The engine
//! resolves every step through a registry instance handed to it at
//! construction; nothing is looked up globally.
//!
//! # Usage
//!
//! ```
//! use workflow_engine::{NodeRegistry, StepOutcome};
//!
//! let mut registry = NodeRegistry::new();
//! registry.register_fn("echo", |_step, ctx| Ok(StepOutcome::success(ctx.input.clone())));
//! assert!(registry.has("echo"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::descriptor::StepDefinition;
use crate::error::Result;
use crate::types::{Step, StepOutcome};

type BoxedStepFuture = Pin<Box<dyn Future<Output = Result<StepOutcome>> + Send>>;

/// Performs one step type
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute the step with its prepared context
    ///
    /// Failures may be returned as `Err` or as [`StepOutcome::Failure`];
    /// the engine treats both the same way.
    async fn execute(&self, step: &Step, context: &ExecutionContext) -> Result<StepOutcome>;

    /// Self-description, if the executor provides one
    fn definition(&self) -> Option<StepDefinition> {
        None
    }
}

/// Registry of step types and their executors
///
/// Registries compose by merging; entries from the merged registry win.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for the type
    pub fn register(&mut self, node_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        let node_type = node_type.into();
        if self.executors.insert(node_type.clone(), executor).is_some() {
            log::debug!("Replaced executor for step type '{}'", node_type);
        }
    }

    /// Register an async closure as the executor for a type
    ///
    /// The closure receives owned copies of the step and its context.
    pub fn register_callback<F, Fut>(&mut self, node_type: impl Into<String>, callback: F)
    where
        F: Fn(Step, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        self.register(node_type, Arc::new(CallbackStepExecutor::new(callback)));
    }

    /// Register a synchronous closure as the executor for a type
    pub fn register_fn<F>(&mut self, node_type: impl Into<String>, callback: F)
    where
        F: Fn(&Step, &ExecutionContext) -> Result<StepOutcome> + Send + Sync + 'static,
    {
        self.register(node_type, Arc::new(SyncCallbackStepExecutor::new(callback)));
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(node_type).cloned()
    }

    pub fn has(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Definitions of every executor that describes itself, sorted by type
    pub fn definitions(&self) -> Vec<StepDefinition> {
        let mut definitions: Vec<StepDefinition> = self
            .executors
            .values()
            .filter_map(|executor| executor.definition())
            .collect();
        definitions.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        definitions
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Merge another registry into this one
    pub fn merge(&mut self, other: NodeRegistry) {
        self.executors.extend(other.executors);
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("types", &self.types())
            .finish()
    }
}

/// Async callback-based executor
pub struct CallbackStepExecutor {
    callback: Box<dyn Fn(Step, ExecutionContext) -> BoxedStepFuture + Send + Sync>,
    definition: Option<StepDefinition>,
}

impl CallbackStepExecutor {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(Step, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |step, context| Box::pin(callback(step, context))),
            definition: None,
        }
    }

    pub fn with_definition(mut self, definition: StepDefinition) -> Self {
        self.definition = Some(definition);
        self
    }
}

#[async_trait]
impl StepExecutor for CallbackStepExecutor {
    async fn execute(&self, step: &Step, context: &ExecutionContext) -> Result<StepOutcome> {
        (self.callback)(step.clone(), context.clone()).await
    }

    fn definition(&self) -> Option<StepDefinition> {
        self.definition.clone()
    }
}

/// Synchronous callback-based executor
pub struct SyncCallbackStepExecutor {
    callback: Box<dyn Fn(&Step, &ExecutionContext) -> Result<StepOutcome> + Send + Sync>,
}

impl SyncCallbackStepExecutor {
    pub fn new(
        callback: impl Fn(&Step, &ExecutionContext) -> Result<StepOutcome> + Send + Sync + 'static,
    ) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl StepExecutor for SyncCallbackStepExecutor {
    async fn execute(&self, step: &Step, context: &ExecutionContext) -> Result<StepOutcome> {
        (self.callback)(step, context)
    }
}
