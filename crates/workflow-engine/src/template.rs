//! Template expressions for field mappings
//!
//! A mapping value is either a literal string or a single reference of the
//! form `{{ root.path.to.field }}`. The reference is tokenized into a root
//! identifier and path segments up front, so strings that merely contain
//! brace characters stay literals.
//!
//! - `{{ input.stepA.text }}` reads from the step's raw upstream input
//! - `{{ stepA.text }}` reads from the recorded output of `stepA`

use serde_json::{Map, Value};

/// Root name that addresses the raw upstream input instead of a step output
pub const INPUT_ROOT: &str = "input";

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// A parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    /// No reference; resolves to the string itself
    Literal(String),
    /// `{{ root.segment.segment }}`
    Reference { root: String, path: Vec<String> },
}

impl Template {
    /// Parse a template string
    ///
    /// Exactly one well-formed `{{ ... }}` marker makes a reference. No
    /// markers, more than one, unbalanced braces or a body that is not a
    /// dotted identifier path all fall back to a literal.
    pub fn parse(source: &str) -> Self {
        match parse_reference(source) {
            Some((root, path)) => Template::Reference { root, path },
            None => Template::Literal(source.to_string()),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Template::Reference { .. })
    }

    /// Resolve against the raw input and the outputs recorded so far
    ///
    /// Returns `None` when the reference cannot be followed, which callers
    /// treat as "undefined" and skip.
    pub fn resolve(&self, input: &Value, node_outputs: &Map<String, Value>) -> Option<Value> {
        match self {
            Template::Literal(text) => Some(Value::String(text.clone())),
            Template::Reference { root, path } => {
                let start = if root == INPUT_ROOT {
                    input
                } else {
                    node_outputs.get(root)?
                };
                lookup_path(start, path.iter().map(String::as_str)).cloned()
            }
        }
    }
}

/// Parse and resolve a template string in one go
pub fn resolve_template(
    template: &str,
    input: &Value,
    node_outputs: &Map<String, Value>,
) -> Option<Value> {
    Template::parse(template).resolve(input, node_outputs)
}

/// Follow dot-path segments through nested objects
///
/// Each segment requires the current value to be a non-null object; arrays
/// are also addressable by numeric index. Anything else yields `None`.
pub fn lookup_path<'a, 'p>(
    value: &'a Value,
    segments: impl IntoIterator<Item = &'p str>,
) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn parse_reference(source: &str) -> Option<(String, Vec<String>)> {
    let open = source.find(OPEN)?;
    let after_open = &source[open + OPEN.len()..];
    let close = after_open.find(CLOSE)?;
    let body = &after_open[..close];
    let rest = &after_open[close + CLOSE.len()..];

    // A second marker (or a stray opener inside the body) keeps it literal
    if body.contains(OPEN) || rest.contains(OPEN) || rest.contains(CLOSE) {
        return None;
    }

    let mut segments = body.trim().split('.');
    let root = segments.next().filter(|s| is_identifier(s))?;
    let path: Vec<String> = segments.map(str::to_string).collect();
    if path.iter().any(|s| !is_identifier(s)) {
        return None;
    }

    Some((root.to_string(), path))
}

fn is_identifier(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '$'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_resolve_input_path() {
        let input = json!({ "user": { "name": "Ana" } });
        assert_eq!(
            resolve_template("{{input.user.name}}", &input, &Map::new()),
            Some(json!("Ana"))
        );
    }

    #[test]
    fn test_plain_text_is_literal() {
        assert_eq!(
            resolve_template("plain text", &json!({}), &Map::new()),
            Some(json!("plain text"))
        );
    }

    #[test]
    fn test_whitespace_inside_marker() {
        let input = json!({ "a": { "b": 2 } });
        assert_eq!(
            resolve_template("{{  input.a.b  }}", &input, &Map::new()),
            Some(json!(2))
        );
    }

    #[test]
    fn test_resolve_node_output() {
        let node_outputs = outputs(json!({
            "fetch": { "body": { "items": [10, 20, 30] }, "status": 200 }
        }));

        assert_eq!(
            resolve_template("{{fetch.status}}", &Value::Null, &node_outputs),
            Some(json!(200))
        );
        assert_eq!(
            resolve_template("{{fetch.body.items.1}}", &Value::Null, &node_outputs),
            Some(json!(20))
        );
        assert_eq!(
            resolve_template("{{fetch}}", &Value::Null, &node_outputs),
            Some(json!({ "body": { "items": [10, 20, 30] }, "status": 200 }))
        );
    }

    #[test]
    fn test_unresolvable_paths_are_undefined() {
        let input = json!({ "user": { "name": "Ana", "tags": null } });
        let node_outputs = outputs(json!({ "a": "scalar" }));

        assert_eq!(resolve_template("{{input.user.age}}", &input, &node_outputs), None);
        assert_eq!(resolve_template("{{input.user.tags.x}}", &input, &node_outputs), None);
        assert_eq!(resolve_template("{{input.user.name.first}}", &input, &node_outputs), None);
        assert_eq!(resolve_template("{{missing.field}}", &input, &node_outputs), None);
        assert_eq!(resolve_template("{{a.length}}", &input, &node_outputs), None);
    }

    #[test]
    fn test_null_leaf_is_defined() {
        let input = json!({ "value": null });
        assert_eq!(
            resolve_template("{{input.value}}", &input, &Map::new()),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_brace_text_stays_literal() {
        for source in [
            "{{ }}",
            "{{}}",
            "{ single }",
            "{{unclosed",
            "closed}}",
            "{{a.b}} and {{c.d}}",
            "{{a..b}}",
            "{{a b}}",
            "{{ {{a}} }}",
        ] {
            assert_eq!(
                Template::parse(source),
                Template::Literal(source.to_string()),
                "{:?} should be literal",
                source
            );
        }
    }

    #[test]
    fn test_surrounding_text_uses_reference() {
        // The reference decides the value; surrounding text is not interpolated
        let input = json!({ "name": "Ana" });
        assert_eq!(
            resolve_template("Hello {{input.name}}!", &input, &Map::new()),
            Some(json!("Ana"))
        );
    }

    #[test]
    fn test_parse_reference_segments() {
        assert_eq!(
            Template::parse("{{ step-1.data.$ref }}"),
            Template::Reference {
                root: "step-1".to_string(),
                path: vec!["data".to_string(), "$ref".to_string()],
            }
        );
        assert!(Template::parse("{{input}}").is_reference());
    }
}
