//! Core types for workflow graphs
//!
//! These types define the structure of a workflow: its steps, the
//! connections between them, and workflow-wide settings.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unique identifier for a step
pub type NodeId = String;

/// Unique identifier for a connection
pub type EdgeId = String;

/// Ordered mapping from a destination field path to a template expression
///
/// Order matters: later entries can overwrite fields written by earlier ones,
/// so the declaration order of the workflow is preserved through serde.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMappings(Vec<(String, String)>);

impl FieldMappings {
    /// Create an empty mapping table
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a mapping (a repeated destination replaces the earlier template)
    pub fn insert(&mut self, destination: impl Into<String>, template: impl Into<String>) {
        let destination = destination.into();
        let template = template.into();
        if let Some(entry) = self.0.iter_mut().find(|(d, _)| *d == destination) {
            entry.1 = template;
        } else {
            self.0.push((destination, template));
        }
    }

    /// Iterate over `(destination, template)` pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(d, t)| (d.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FieldMappings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut mappings = Self::new();
        for (destination, template) in iter {
            mappings.insert(destination, template);
        }
        mappings
    }
}

impl Serialize for FieldMappings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(d, t)| (d, t)))
    }
}

impl<'de> Deserialize<'de> for FieldMappings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MappingsVisitor;

        impl<'de> Visitor<'de> for MappingsVisitor {
            type Value = FieldMappings;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of destination paths to template strings")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut mappings = FieldMappings::new();
                while let Some((destination, template)) =
                    access.next_entry::<String, String>()?
                {
                    mappings.insert(destination, template);
                }
                Ok(mappings)
            }
        }

        deserializer.deserialize_map(MappingsVisitor)
    }
}

/// Per-step data bag: static configuration plus execution options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepData {
    /// User-supplied static parameters, handed to the executor untouched
    #[serde(default)]
    pub config: serde_json::Value,
    /// Human-readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Executor-specific subtype (e.g. the operation of a multi-purpose step)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Step-level field mappings; these win over connection mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<FieldMappings>,
    /// Overrides the retry handler's `max_retries` for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Per-step timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Disabled steps are skipped by the engine
    #[serde(default)]
    pub disabled: bool,
    /// Authoring data the engine does not interpret
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A step (node) instance in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: NodeId,
    /// Executor type (looked up in the node registry)
    #[serde(rename = "type")]
    pub node_type: String,
    /// Configuration and options for this instance
    #[serde(default)]
    pub data: StepData,
}

impl Step {
    /// Create a step with empty configuration
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data: StepData::default(),
        }
    }

    /// The configured label, falling back to the step type
    pub fn display_label(&self) -> &str {
        self.data.label.as_deref().unwrap_or(&self.node_type)
    }
}

/// A directed connection between two steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Unique identifier for this connection
    #[serde(default)]
    pub id: EdgeId,
    /// Source step ID
    pub source: NodeId,
    /// Target step ID
    pub target: NodeId,
    /// Opaque condition, interpreted by executors only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Connection-level field mappings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mappings: Option<FieldMappings>,
}

impl Connection {
    /// Create a plain connection without condition or mappings
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
            mappings: None,
        }
    }
}

/// Workflow-wide settings consumed by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    /// Maximum number of independent steps run at once (1 = sequential)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Default per-step timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Keep running after a step fails terminally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
}

/// A complete workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique identifier for this workflow
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Steps in authoring order
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Connections between steps
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Engine settings
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    /// Create a new empty workflow
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Find a step by ID
    pub fn find_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Get connections coming into a step
    pub fn incoming_connections<'a>(
        &'a self,
        step_id: &'a str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.target == step_id)
    }

    /// Get connections going out of a step
    pub fn outgoing_connections<'a>(
        &'a self,
        step_id: &'a str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.source == step_id)
    }
}

/// What a step executor produced
///
/// Executors either succeed with an output (and optionally variables to merge
/// into the run's variable pool) or report a failure message. A returned
/// failure is treated exactly like an error return by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StepOutcome {
    Success {
        #[serde(default)]
        output: serde_json::Value,
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        variables: serde_json::Map<String, serde_json::Value>,
    },
    Failure {
        error: String,
    },
}

impl StepOutcome {
    /// A successful outcome without variables
    pub fn success(output: serde_json::Value) -> Self {
        Self::Success {
            output,
            variables: serde_json::Map::new(),
        }
    }

    /// A failed outcome
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    /// Attach a variable to a successful outcome (no-op on failures)
    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        if let Self::Success { variables, .. } = &mut self {
            variables.insert(name.into(), value);
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The produced output, if successful
    pub fn output(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Success { output, .. } => Some(output),
            Self::Failure { .. } => None,
        }
    }

    /// The failure message, if failed
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_deserializes_type_and_options() {
        let step: Step = serde_json::from_value(json!({
            "id": "fetch",
            "type": "http",
            "data": {
                "config": { "url": "https://example.com" },
                "label": "Fetch page",
                "retries": 4,
                "timeoutMs": 2500,
                "disabled": true,
                "position": { "x": 10, "y": 20 }
            }
        }))
        .unwrap();

        assert_eq!(step.node_type, "http");
        assert_eq!(step.data.retries, Some(4));
        assert_eq!(step.data.timeout_ms, Some(2500));
        assert!(step.data.disabled);
        assert_eq!(step.display_label(), "Fetch page");
        assert!(step.data.extra.contains_key("position"));
    }

    #[test]
    fn test_display_label_falls_back_to_type() {
        let step = Step::new("a", "transform");
        assert_eq!(step.display_label(), "transform");
    }

    #[test]
    fn test_mappings_keep_declaration_order() {
        let conn: Connection = serde_json::from_value(json!({
            "id": "c1",
            "source": "a",
            "target": "b",
            "mappings": {
                "zeta": "{{input.a.z}}",
                "alpha": "{{input.a.a}}",
                "mid.deep": "literal"
            }
        }))
        .unwrap();

        let mappings = conn.mappings.unwrap();
        let destinations: Vec<&str> = mappings.iter().map(|(d, _)| d).collect();
        assert_eq!(destinations, vec!["zeta", "alpha", "mid.deep"]);

        let serialized = serde_json::to_string(&mappings).unwrap();
        assert!(serialized.find("zeta").unwrap() < serialized.find("alpha").unwrap());
    }

    #[test]
    fn test_step_outcome_tagging() {
        let outcome: StepOutcome = serde_json::from_value(json!({
            "status": "success",
            "output": { "text": "hi" },
            "variables": { "count": 1 }
        }))
        .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.output(), Some(&json!({ "text": "hi" })));

        let failed = StepOutcome::failure("rate limit exceeded").with_variable("ignored", json!(1));
        assert_eq!(failed.error(), Some("rate limit exceeded"));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({ "status": "failure", "error": "rate limit exceeded" })
        );
    }

    #[test]
    fn test_workflow_connection_lookup() {
        let mut workflow = Workflow::new("wf", "Test");
        workflow.steps.push(Step::new("a", "input"));
        workflow.steps.push(Step::new("b", "output"));
        workflow.connections.push(Connection::new("c1", "a", "b"));

        assert_eq!(workflow.incoming_connections("b").count(), 1);
        assert_eq!(workflow.outgoing_connections("a").count(), 1);
        assert_eq!(workflow.incoming_connections("a").count(), 0);
        assert!(workflow.find_step("b").is_some());
    }
}
