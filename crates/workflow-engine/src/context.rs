//! Run state and per-step input resolution
//!
//! The `ContextManager` turns everything produced so far in a run into the
//! input a step should receive:
//!
//! 1. gather upstream outputs keyed by upstream step ID (the raw input)
//! 2. apply connection mappings, then step mappings (step wins)
//! 3. merge raw input with the mapped fields (mapped wins)
//! 4. auto-flatten a single upstream object into the top level
//! 5. fill convenience aliases (`prompt`, `text`, `query`)
//!
//! It also records what a step produced. It performs no I/O and holds no
//! run-scoped state, so one instance can serve any number of runs.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::template::Template;
use crate::types::{Connection, NodeId, Step, StepOutcome};

/// Session ID used when the caller does not supply one
pub const DEFAULT_SESSION_ID: &str = "default-session";
/// Agent ID used when the caller does not supply one
pub const DEFAULT_AGENT_ID: &str = "default-agent";

/// Key under which an AI provider response is additionally exposed
pub const AI_OUTPUT_KEY: &str = "aiOutput";

/// Input keys that never count towards auto-flattening
const RESERVED_INPUT_KEYS: [&str; 3] = ["data", "filePath", AI_OUTPUT_KEY];

/// `(missing field, synonym it is filled from)`, applied in order
const INPUT_ALIASES: [(&str, &str); 4] = [
    ("prompt", "text"),
    ("prompt", "content"),
    ("text", "content"),
    ("query", "prompt"),
];

/// Provider names that mark an upstream output as an AI response
pub const DEFAULT_AI_PROVIDERS: [&str; 8] = [
    "openai",
    "anthropic",
    "google",
    "gemini",
    "ollama",
    "mistral",
    "groq",
    "cohere",
];

/// Everything a step executor sees
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub run_id: String,
    pub workflow_id: String,
    /// Step this context was built for (None for the run's base context)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Original run input for triggers, prepared input otherwise
    pub input: Value,
    pub output: Map<String, Value>,
    pub variables: Map<String, Value>,
    pub credentials: Map<String, Value>,
    /// Outputs recorded so far in the run, keyed by step ID
    pub node_outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_id: String,
    pub agent_id: String,
}

/// Mutable state of one run
///
/// Owned by the engine driving the run; the context manager only mutates it
/// through [`ContextManager::record_step_output`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: String,
    pub workflow_id: String,
    /// Shared variable pool, shallow-merged from step results
    pub variables: Map<String, Value>,
    /// Step ID -> produced output (append-only during the run)
    pub node_outputs: Map<String, Value>,
    /// One record per attempted step
    pub results: Vec<StepResultRecord>,
}

impl RunState {
    /// Start a run from its base context
    pub fn from_context(context: &ExecutionContext) -> Self {
        Self {
            run_id: context.run_id.clone(),
            workflow_id: context.workflow_id.clone(),
            variables: context.variables.clone(),
            node_outputs: Map::new(),
            results: Vec::new(),
        }
    }

    /// Recorded output of a step
    pub fn output_of(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    /// Result record of a step
    pub fn result_of(&self, node_id: &str) -> Option<&StepResultRecord> {
        self.results.iter().find(|r| r.node_id == node_id)
    }
}

/// Outcome of one attempted step, as reported to users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResultRecord {
    pub node_id: NodeId,
    pub success: bool,
    /// Raw output for successful steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Configured label, or the step type
    pub label: String,
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// RFC 3339 timestamp of when the record was made
    pub timestamp: String,
    pub duration_ms: u64,
    /// Attempts used (1 when the first attempt settled it)
    #[serde(default)]
    pub attempts: u32,
    /// The step was disabled and not executed
    #[serde(default)]
    pub skipped: bool,
}

/// Builds step inputs and records step outputs
#[derive(Debug, Clone)]
pub struct ContextManager {
    ai_providers: HashSet<String>,
}

impl ContextManager {
    /// Create a context manager with the default AI provider allow-list
    pub fn new() -> Self {
        Self {
            ai_providers: DEFAULT_AI_PROVIDERS.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Replace the provider names that mark an output as an AI response
    pub fn with_ai_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ai_providers = providers.into_iter().map(Into::into).collect();
        self
    }

    /// Build the base context of a run
    ///
    /// Input and variable pool both start as a copy of the initial input
    /// with the user ID folded in. A non-object input is kept under `input`.
    pub fn create_initial_context(
        &self,
        run_id: impl Into<String>,
        workflow_id: impl Into<String>,
        initial_input: &Value,
        user_id: Option<&str>,
    ) -> ExecutionContext {
        let mut input = match initial_input {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other.clone());
                map
            }
        };
        if let Some(user_id) = user_id {
            input.insert("userId".to_string(), Value::String(user_id.to_string()));
        }

        ExecutionContext {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            node_id: None,
            variables: input.clone(),
            input: Value::Object(input),
            output: Map::new(),
            credentials: Map::new(),
            node_outputs: Map::new(),
            user_id: user_id.map(str::to_string),
            session_id: DEFAULT_SESSION_ID.to_string(),
            agent_id: DEFAULT_AGENT_ID.to_string(),
        }
    }

    /// Build the context a step executes with
    ///
    /// Trigger steps get the run's original input verbatim; every other step
    /// gets its prepared input. Outputs and variables are snapshots of the
    /// run as it stands now.
    pub fn context_for_step(
        &self,
        base: &ExecutionContext,
        step: &Step,
        connections: &[Connection],
        run: &RunState,
    ) -> ExecutionContext {
        let has_incoming = connections.iter().any(|c| c.target == step.id);
        let input = if has_incoming {
            self.prepare_input(step, connections, &run.node_outputs)
        } else {
            base.input.clone()
        };

        ExecutionContext {
            node_id: Some(step.id.clone()),
            input,
            output: Map::new(),
            variables: run.variables.clone(),
            node_outputs: run.node_outputs.clone(),
            ..base.clone()
        }
    }

    /// Upstream outputs keyed by upstream step ID
    ///
    /// Outputs that look like an AI provider response are also exposed under
    /// `aiOutput` (the last such upstream wins).
    pub fn gather_raw_input(
        &self,
        step_id: &str,
        connections: &[Connection],
        node_outputs: &Map<String, Value>,
    ) -> Map<String, Value> {
        let mut raw = Map::new();

        for conn in connections.iter().filter(|c| c.target == step_id) {
            let Some(output) = node_outputs.get(&conn.source) else {
                log::debug!(
                    "No output recorded for '{}' (upstream of '{}')",
                    conn.source,
                    step_id
                );
                continue;
            };

            raw.insert(conn.source.clone(), output.clone());
            if self.is_ai_output(output) {
                raw.insert(AI_OUTPUT_KEY.to_string(), output.clone());
            }
        }

        raw
    }

    /// Compute the fully resolved input for a step with upstream connections
    pub fn prepare_input(
        &self,
        step: &Step,
        connections: &[Connection],
        node_outputs: &Map<String, Value>,
    ) -> Value {
        let mut input = self.gather_raw_input(&step.id, connections, node_outputs);
        let raw_value = Value::Object(input.clone());
        let mut mapped = Map::new();

        let connection_mappings = connections
            .iter()
            .filter(|c| c.target == step.id)
            .filter_map(|c| c.mappings.as_ref());
        let step_mappings = step.data.mappings.iter();

        for mappings in connection_mappings.chain(step_mappings) {
            for (destination, template) in mappings.iter() {
                let Some(value) = Template::parse(template).resolve(&raw_value, node_outputs) else {
                    log::debug!(
                        "Mapping '{}' for step '{}' resolved to nothing, skipping",
                        destination,
                        step.id
                    );
                    continue;
                };
                if !set_path(&mut mapped, destination, value) {
                    log::warn!(
                        "Cannot write mapping '{}' for step '{}': path crosses a non-object value",
                        destination,
                        step.id
                    );
                }
            }
        }

        for (key, value) in mapped {
            input.insert(key, value);
        }

        flatten_single_upstream(&mut input);
        apply_aliases(&mut input);

        Value::Object(input)
    }

    /// Write a finished step's output and variables into the run
    ///
    /// Only successful outcomes are recorded; returns whether anything was
    /// written.
    pub fn record_step_output(
        &self,
        run: &mut RunState,
        step_id: &str,
        outcome: &StepOutcome,
    ) -> bool {
        let StepOutcome::Success { output, variables } = outcome else {
            return false;
        };

        run.node_outputs.insert(step_id.to_string(), output.clone());
        for (name, value) in variables {
            run.variables.insert(name.clone(), value.clone());
        }
        true
    }

    /// Build the user-facing record of an attempted step
    pub fn create_result_record(
        &self,
        step: &Step,
        outcome: &StepOutcome,
        duration: Duration,
        attempts: u32,
    ) -> StepResultRecord {
        StepResultRecord {
            node_id: step.id.clone(),
            success: outcome.is_success(),
            result: outcome.output().cloned(),
            error: outcome.error().map(str::to_string),
            label: step.display_label().to_string(),
            node_type: step.node_type.clone(),
            subtype: step.data.subtype.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_ms: duration.as_millis() as u64,
            attempts,
            skipped: false,
        }
    }

    /// Record for a disabled step that was not executed
    pub fn create_skipped_record(&self, step: &Step) -> StepResultRecord {
        StepResultRecord {
            skipped: true,
            ..self.create_result_record(step, &StepOutcome::success(Value::Null), Duration::ZERO, 0)
        }
    }

    fn is_ai_output(&self, output: &Value) -> bool {
        output
            .get("provider")
            .and_then(Value::as_str)
            .map(|p| self.ai_providers.contains(p))
            .unwrap_or(false)
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Write `value` at a dot-separated path, creating objects on the way
///
/// Returns false (and writes nothing) when an intermediate segment already
/// holds a non-object value, or the path is empty.
pub fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return false;
    }
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut current = target;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(map) => current = map,
            _ => return false,
        }
    }

    current.insert(last.to_string(), value);
    true
}

/// Merge the fields of a lone upstream object into the top level
fn flatten_single_upstream(input: &mut Map<String, Value>) {
    let mut candidates = input
        .keys()
        .filter(|k| !RESERVED_INPUT_KEYS.contains(&k.as_str()));
    let (Some(key), None) = (candidates.next(), candidates.next()) else {
        return;
    };

    let Some(Value::Object(fields)) = input.get(key.as_str()).cloned() else {
        return;
    };
    for (name, value) in fields {
        if !input.contains_key(&name) {
            input.insert(name, value);
        }
    }
}

fn apply_aliases(input: &mut Map<String, Value>) {
    for (missing, synonym) in INPUT_ALIASES {
        if input.contains_key(missing) {
            continue;
        }
        if let Some(value) = input.get(synonym).cloned() {
            input.insert(missing.to_string(), value);
        }
    }
}
