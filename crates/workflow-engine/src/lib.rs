//! Workflow Engine - directed-graph step execution
//!
//! This crate runs workflows made of named steps connected by edges. Each
//! step is performed by a pluggable executor looked up by type. It provides:
//!
//! - Dependency ordering and structural validation of the graph
//! - Data flow between steps: upstream outputs, field mappings and
//!   `{{ step.path }}` template references
//! - Bounded retry with exponential backoff for transient failures
//! - Optional branch parallelism through a ready-queue scheduler
//!
//! # Architecture
//!
//! - `graph` / `validation`: ordering, lineage queries and structure checks
//! - `context`: per-step input resolution and run bookkeeping
//! - `retry`: the retry policy wrapped around each step invocation
//! - `engine`: `WorkflowEngine`, which drives one run through the above
//! - `registry`, `events`, `state`: the seams to executors, monitoring
//!   and persistence
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use workflow_engine::{
//!     EngineConfig, ExecuteOptions, NodeRegistry, StepOutcome, WorkflowBuilder, WorkflowEngine,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> workflow_engine::Result<()> {
//! let mut registry = NodeRegistry::new();
//! registry.register_fn("greet", |_step, ctx| {
//!     let name = ctx.input["name"].as_str().unwrap_or("stranger");
//!     Ok(StepOutcome::success(json!({ "greeting": format!("Hello, {}", name) })))
//! });
//!
//! let workflow = WorkflowBuilder::new("hello", "Hello")
//!     .add_step("greet", "greet")
//!     .build();
//!
//! let engine = WorkflowEngine::new(Arc::new(registry), EngineConfig::default());
//! let report = engine
//!     .execute(&workflow, json!({ "name": "Ana" }), ExecuteOptions::new())
//!     .await?;
//! assert_eq!(report.output("greet"), Some(&json!({ "greeting": "Hello, Ana" })));
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod registry;
pub mod retry;
pub mod state;
pub mod template;
pub mod types;
pub mod validation;

// Re-export key types
pub use builder::WorkflowBuilder;
pub use config::EngineConfig;
pub use context::{ContextManager, ExecutionContext, RunState, StepResultRecord};
pub use descriptor::{FieldMetadata, FieldType, StepCategory, StepDefinition, StepDescriptor};
pub use engine::{CancellationFlag, ExecuteOptions, RunReport, WorkflowEngine};
pub use error::{Result, WorkflowError};
pub use events::{ChannelEventSink, EventSink, NullEventSink, VecEventSink, WorkflowEvent};
pub use graph::{execution_order, ReadyQueue};
pub use registry::{CallbackStepExecutor, NodeRegistry, StepExecutor, SyncCallbackStepExecutor};
pub use retry::{RetryConfig, RetryHandler};
pub use state::{InMemoryStateStore, StateStore};
pub use template::{resolve_template, Template};
pub use types::{
    Connection, EdgeId, FieldMappings, NodeId, Step, StepData, StepOutcome, Workflow,
    WorkflowSettings,
};
pub use validation::{validate_graph, GraphIssue, GraphValidation};
