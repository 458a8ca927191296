//! Step definition metadata
//!
//! Executors can describe the step type they implement: a label, a
//! category for grouping, and the config fields they read. The engine uses
//! the required fields to reject a misconfigured step before running it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trait for executors that can describe their step type
pub trait StepDescriptor {
    fn descriptor() -> StepDefinition
    where
        Self: Sized;
}

/// Broad grouping of step types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepCategory {
    Trigger,
    Action,
    Transform,
    Ai,
    Control,
}

/// Value type expected in a config or output field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Any,
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    /// Whether a JSON value fits this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Any => true,
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

/// One field of a step's config or output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMetadata {
    pub id: String,
    pub label: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldMetadata {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        field_type: FieldType,
        required: bool,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            field_type,
            required,
        }
    }

    pub fn required(
        id: impl Into<String>,
        label: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        Self::new(id, label, field_type, true)
    }

    pub fn optional(
        id: impl Into<String>,
        label: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        Self::new(id, label, field_type, false)
    }
}

/// Complete metadata for a step type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Type identifier matched against `Step::node_type`
    pub node_type: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub category: StepCategory,
    /// Fields read from `StepData::config`
    #[serde(default)]
    pub config: Vec<FieldMetadata>,
    /// Fields of the output object
    #[serde(default)]
    pub outputs: Vec<FieldMetadata>,
}

impl StepDefinition {
    pub fn new(
        node_type: impl Into<String>,
        label: impl Into<String>,
        category: StepCategory,
    ) -> Self {
        Self {
            node_type: node_type.into(),
            label: label.into(),
            description: String::new(),
            category,
            config: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_config_field(mut self, field: FieldMetadata) -> Self {
        self.config.push(field);
        self
    }

    pub fn with_output(mut self, field: FieldMetadata) -> Self {
        self.outputs.push(field);
        self
    }

    /// Check a step config against the declared fields
    ///
    /// Returns one message per problem: a required field that is absent or
    /// null, or a present field whose value has the wrong type.
    pub fn check_config(&self, config: &Value) -> Vec<String> {
        let mut problems = Vec::new();

        for field in &self.config {
            match config.get(&field.id) {
                None | Some(Value::Null) => {
                    if field.required {
                        problems.push(format!("missing required field '{}'", field.id));
                    }
                }
                Some(value) if !field.field_type.accepts(value) => {
                    problems.push(format!(
                        "field '{}' should be {:?}",
                        field.id, field.field_type
                    ));
                }
                Some(_) => {}
            }
        }

        problems
    }
}
