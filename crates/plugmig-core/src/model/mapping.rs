//! Field mappings and validation rules for batched data transforms.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::connection::Value;

fn default_batch_size() -> usize {
    1000
}

fn default_key_column() -> String {
    "id".to_string()
}

/// Batched data migration from a source table to a target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformSpec {
    /// Source table.
    #[serde(rename = "source")]
    pub source_table: String,
    /// Target table.
    #[serde(rename = "target")]
    pub target_table: String,
    /// Primary-key column used to order pages deterministically.
    #[serde(default = "default_key_column")]
    pub key_column: String,
    /// Field mappings, applied in order.
    #[serde(rename = "mapping")]
    pub mappings: Vec<FieldMapping>,
    /// Optional SQL filter over source rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Rows per page/write batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Row-level validation rules.
    #[serde(rename = "validation", default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<ValidationRule>,
}

impl TransformSpec {
    /// Create a transform between two tables with no mappings yet.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_table: source.into(),
            target_table: target.into(),
            key_column: default_key_column(),
            mappings: Vec::new(),
            filter: None,
            batch_size: default_batch_size(),
            validations: Vec::new(),
        }
    }

    /// Add a field mapping.
    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Restrict source rows.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the page/write batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the ordering key column.
    pub fn with_key_column(mut self, column: impl Into<String>) -> Self {
        self.key_column = column.into();
        self
    }

    /// Add a validation rule.
    pub fn with_validation(mut self, rule: ValidationRule) -> Self {
        self.validations.push(rule);
        self
    }
}

/// Maps one source field to one target field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    /// Source column.
    pub source: String,
    /// Target column.
    pub target: String,
    /// Optional value transformation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<FieldTransform>,
    /// Fallback when the source value is missing or NULL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// A required field with no source value and no default fails the row.
    #[serde(default)]
    pub required: bool,
}

impl FieldMapping {
    /// Straight copy from `source` to `target`.
    pub fn copy(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            transform: None,
            default_value: None,
            required: false,
        }
    }

    /// Attach a transformation.
    pub fn with_transform(mut self, transform: FieldTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Set the fallback value.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Mark the field required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Named built-in transform functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinFunction {
    /// Uppercase text.
    Upper,
    /// Lowercase text.
    Lower,
    /// Trim surrounding whitespace.
    Trim,
    /// Round a number; first parameter is the digit count (default 0).
    Round,
    /// Concatenate the value with the parameter texts, in order.
    Concat,
}

/// Where a lookup transform finds its value table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LookupSource {
    /// Inline key/value table.
    Inline(BTreeMap<String, Value>),
    /// Query returning key/value pairs in its first two columns, run once
    /// per transform.
    Query(String),
}

/// A field-level value transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldTransform {
    /// Named built-in.
    Function {
        /// Which builtin to apply.
        definition: BuiltinFunction,
        /// Function parameters.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        parameters: Vec<Value>,
    },
    /// Template with `{field}` placeholders, evaluated in-process against
    /// the source row.
    Expression {
        /// The template.
        definition: String,
    },
    /// Map the source value through a value table.
    Lookup {
        /// The value table.
        definition: LookupSource,
    },
    /// Named transform registered by the plugin author.
    Custom {
        /// Registered name.
        definition: String,
    },
}

/// Severity of a validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Failing rows are skipped and counted as failed.
    Error,
    /// Failures are logged; the row proceeds.
    Warning,
}

/// Predicate a validation rule applies to a field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum ValuePredicate {
    /// Value must not be NULL.
    NotNull,
    /// Text value must be non-empty after trimming.
    NonEmpty,
    /// Value must be numeric.
    Numeric,
    /// Text length must not exceed the limit.
    MaxLength(usize),
    /// Value must equal one of the listed values.
    OneOf(Vec<Value>),
}

impl ValuePredicate {
    /// Evaluate the predicate against a value.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValuePredicate::NotNull => !value.is_null(),
            ValuePredicate::NonEmpty => {
                value.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false)
            }
            ValuePredicate::Numeric => value.as_f64().is_some(),
            ValuePredicate::MaxLength(limit) => value
                .as_str()
                .map(|s| s.chars().count() <= *limit)
                .unwrap_or(true),
            ValuePredicate::OneOf(allowed) => allowed.contains(value),
        }
    }
}

/// Row-level validation applied to the mapped (target) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    /// Target field the rule applies to.
    pub field: String,
    /// The predicate.
    pub rule: ValuePredicate,
    /// Message reported on failure.
    pub message: String,
    /// Whether failures skip the row or just log.
    pub severity: Severity,
}

impl ValidationRule {
    /// An error-severity rule.
    pub fn error(field: impl Into<String>, rule: ValuePredicate, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            rule,
            message: message.into(),
            severity: Severity::Error,
        }
    }

    /// A warning-severity rule.
    pub fn warning(
        field: impl Into<String>,
        rule: ValuePredicate,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            rule,
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(ValuePredicate::NotNull.matches(&Value::Integer(1)));
        assert!(!ValuePredicate::NotNull.matches(&Value::Null));
        assert!(ValuePredicate::NonEmpty.matches(&Value::Text("x".into())));
        assert!(!ValuePredicate::NonEmpty.matches(&Value::Text("  ".into())));
        assert!(ValuePredicate::Numeric.matches(&Value::Float(1.5)));
        assert!(!ValuePredicate::Numeric.matches(&Value::Text("a".into())));
        assert!(ValuePredicate::MaxLength(3).matches(&Value::Text("abc".into())));
        assert!(!ValuePredicate::MaxLength(2).matches(&Value::Text("abc".into())));
        assert!(ValuePredicate::OneOf(vec![Value::Text("a".into())])
            .matches(&Value::Text("a".into())));
    }

    #[test]
    fn test_field_transform_tagged_serde() {
        let t = FieldTransform::Function {
            definition: BuiltinFunction::Round,
            parameters: vec![Value::Integer(2)],
        };
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["definition"], "round");

        let back: FieldTransform = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_transform_spec_serde_field_names() {
        let spec = TransformSpec::new("old_users", "users")
            .with_mapping(FieldMapping::copy("id", "id").required())
            .with_filter("active = TRUE");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["source"], "old_users");
        assert_eq!(json["target"], "users");
        assert!(json["mapping"].is_array());
        assert_eq!(json["batchSize"], 1000);
    }
}
