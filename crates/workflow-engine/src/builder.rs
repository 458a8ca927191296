//! Fluent builder for workflows
//!
//! Provides a compact API for constructing workflows programmatically,
//! mostly used by hosts that generate graphs and by tests.

use crate::types::{Connection, FieldMappings, Step, Workflow, WorkflowSettings};

/// Fluent builder for constructing workflows
///
/// # Example
///
/// ```
/// use workflow_engine::WorkflowBuilder;
///
/// let workflow = WorkflowBuilder::new("wf-1", "Summarize")
///     .add_step("fetch", "http")
///     .with_config(serde_json::json!({ "url": "https://example.com" }))
///     .add_step("summarize", "llm")
///     .connect("fetch", "summarize")
///     .with_mapping("prompt", "{{input.fetch.body}}")
///     .build();
///
/// assert_eq!(workflow.steps.len(), 2);
/// assert_eq!(workflow.connections.len(), 1);
/// ```
pub struct WorkflowBuilder {
    id: String,
    name: String,
    steps: Vec<Step>,
    connections: Vec<Connection>,
    settings: WorkflowSettings,
    connection_counter: usize,
    last: Last,
}

/// Which item the `with_*` modifiers apply to
enum Last {
    None,
    Step,
    Connection,
}

impl WorkflowBuilder {
    /// Create a new workflow builder
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
            connection_counter: 0,
            last: Last::None,
        }
    }

    /// Add a step to the workflow
    pub fn add_step(mut self, id: impl Into<String>, node_type: impl Into<String>) -> Self {
        self.steps.push(Step::new(id, node_type));
        self.last = Last::Step;
        self
    }

    /// Set the static config of the most recently added step
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        if let Some(step) = self.last_step() {
            step.data.config = config;
        }
        self
    }

    /// Set the label of the most recently added step
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        if let Some(step) = self.last_step() {
            step.data.label = Some(label.into());
        }
        self
    }

    /// Override the retry count of the most recently added step
    pub fn with_retries(mut self, retries: u32) -> Self {
        if let Some(step) = self.last_step() {
            step.data.retries = Some(retries);
        }
        self
    }

    /// Set the timeout of the most recently added step
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let Some(step) = self.last_step() {
            step.data.timeout_ms = Some(timeout_ms);
        }
        self
    }

    /// Mark the most recently added step as disabled
    pub fn disabled(mut self) -> Self {
        if let Some(step) = self.last_step() {
            step.data.disabled = true;
        }
        self
    }

    /// Add a field mapping to the most recently added step or connection
    pub fn with_mapping(
        mut self,
        destination: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        let mappings = match self.last {
            Last::Step => self.steps.last_mut().map(|s| &mut s.data.mappings),
            Last::Connection => self.connections.last_mut().map(|c| &mut c.mappings),
            Last::None => None,
        };
        if let Some(mappings) = mappings {
            mappings
                .get_or_insert_with(FieldMappings::new)
                .insert(destination, template);
        }
        self
    }

    /// Connect two steps (auto-generates the connection ID)
    pub fn connect(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.connection_counter += 1;
        let id = format!("conn-{}", self.connection_counter);
        self.connections.push(Connection::new(id, source, target));
        self.last = Last::Connection;
        self
    }

    /// Set the condition of the most recently added connection
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        if let (Last::Connection, Some(conn)) = (&self.last, self.connections.last_mut()) {
            conn.condition = Some(condition.into());
        }
        self
    }

    /// Run up to `concurrency` independent steps at once
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.settings.concurrency = Some(concurrency);
        self
    }

    /// Default per-step timeout
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.settings.timeout_ms = Some(timeout_ms);
        self
    }

    /// Keep running after a step fails terminally
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.settings.continue_on_error = Some(continue_on_error);
        self
    }

    /// Build the workflow without validation
    pub fn build(self) -> Workflow {
        Workflow {
            id: self.id,
            name: self.name,
            steps: self.steps,
            connections: self.connections,
            settings: self.settings,
        }
    }

    fn last_step(&mut self) -> Option<&mut Step> {
        match self.last {
            Last::Step => self.steps.last_mut(),
            _ => None,
        }
    }
}
