//! The schema-validation collaborator contract.
//!
//! The pipeline consumes validation through the narrow [`Schema`] trait and
//! treats any non-empty issue list as "unprocessable input"; it forwards
//! issues to the client verbatim and never inspects their internals. Any
//! validation library can be plugged in behind the trait; two
//! implementations ship with the crate: [`TypedSchema`] (serde round-trip)
//! and [`ObjectSchema`] (declarative field rules).

use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::marker::PhantomData;

/// One validation failure, serialized to the client as-is.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Issue {
    /// Path of the offending value, e.g. `["email"]`.
    pub path: Vec<String>,
    /// Human-readable description of the failure.
    pub message: String,
}

impl Issue {
    pub fn new(path: Vec<String>, message: impl ToString) -> Self {
        Issue {
            path,
            message: message.to_string(),
        }
    }

    pub fn root(message: impl ToString) -> Self {
        Issue::new(Vec::new(), message)
    }

    pub fn field(name: &str, message: impl ToString) -> Self {
        Issue::new(vec![name.to_string()], message)
    }
}

/// Validates a JSON value, returning the (possibly coerced) value or the
/// list of failures.
pub trait Schema: Send + Sync {
    fn validate(&self, input: &Value) -> Result<Value, Vec<Issue>>;
}

/// Schema backed by a serde round-trip through `T`.
///
/// Validation succeeds when the input deserializes into `T`; the validated
/// value is `T` serialized back, so defaults and renames applied by the
/// type's serde attributes are reflected in what the handler sees.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        TypedSchema {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Schema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize,
{
    fn validate(&self, input: &Value) -> Result<Value, Vec<Issue>> {
        let typed: T =
            serde_json::from_value(input.clone()).map_err(|err| vec![Issue::root(err.to_string())])?;

        serde_json::to_value(&typed).map_err(|err| vec![Issue::root(err.to_string())])
    }
}

/// Expected JSON type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldKind::String => "a string",
            FieldKind::Number => "a number",
            FieldKind::Boolean => "a boolean",
            FieldKind::Object => "an object",
            FieldKind::Array => "an array",
            FieldKind::Any => "any value",
        }
    }
}

struct FieldRule {
    name: &'static str,
    kind: FieldKind,
    required: bool,
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<Regex>,
}

/// Declarative object schema: named fields with type, length, and pattern
/// rules. Unknown fields pass through untouched.
#[derive(Default)]
pub struct ObjectSchema {
    fields: Vec<FieldRule>,
}

impl ObjectSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            name,
            kind,
            required: true,
            min_length: None,
            max_length: None,
            pattern: None,
        });
        self
    }

    pub fn optional(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            name,
            kind,
            required: false,
            min_length: None,
            max_length: None,
            pattern: None,
        });
        self
    }

    /// Constrains the length of the most recently declared field.
    ///
    /// # Panics
    ///
    /// Panics when no field has been declared yet.
    pub fn length(mut self, min: usize, max: usize) -> Self {
        let rule = self
            .fields
            .last_mut()
            .expect("length() must follow a field declaration");
        rule.min_length = Some(min);
        rule.max_length = Some(max);
        self
    }

    /// Constrains the most recently declared field to a regular expression.
    ///
    /// # Panics
    ///
    /// Panics when no field has been declared yet, or on an invalid pattern.
    pub fn pattern(mut self, pattern: &str) -> Self {
        let rule = self
            .fields
            .last_mut()
            .expect("pattern() must follow a field declaration");
        rule.pattern = Some(Regex::new(pattern).expect("Invalid regex"));
        self
    }

    fn check_field(rule: &FieldRule, value: &Value, issues: &mut Vec<Issue>) {
        if !rule.kind.accepts(value) {
            issues.push(Issue::field(
                rule.name,
                format!("'{}' must be {}", rule.name, rule.kind.describe()),
            ));
            return;
        }

        if let Some(text) = value.as_str() {
            let len = text.len();
            if let (Some(min), Some(max)) = (rule.min_length, rule.max_length)
                && (len < min || len > max)
            {
                issues.push(Issue::field(
                    rule.name,
                    format!("'{}' must be between {} and {} characters long", rule.name, min, max),
                ));
            }

            if let Some(pattern) = &rule.pattern
                && !pattern.is_match(text)
            {
                issues.push(Issue::field(
                    rule.name,
                    format!("'{}' does not match the expected format", rule.name),
                ));
            }
        }
    }
}

impl Schema for ObjectSchema {
    fn validate(&self, input: &Value) -> Result<Value, Vec<Issue>> {
        // A missing payload validates like an empty object so every required
        // field is reported, not just "expected an object".
        let empty = Map::new();
        let object = match input {
            Value::Object(object) => object,
            Value::Null => &empty,
            _ => return Err(vec![Issue::root("Expected an object")]),
        };

        let mut issues = Vec::new();
        for rule in &self.fields {
            match object.get(rule.name) {
                Some(value) => Self::check_field(rule, value, &mut issues),
                None if rule.required => {
                    issues.push(Issue::field(rule.name, format!("'{}' is required", rule.name)));
                }
                None => {}
            }
        }

        if issues.is_empty() {
            Ok(Value::Object(object.clone()))
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn user_schema() -> ObjectSchema {
        ObjectSchema::new()
            .required("name", FieldKind::String)
            .required("email", FieldKind::String)
            .optional("age", FieldKind::Number)
    }

    #[test]
    fn valid_object_passes_through() {
        let value = json!({"name": "x", "email": "x@example.com", "extra": true});
        assert_eq!(user_schema().validate(&value).unwrap(), value);
    }

    #[test]
    fn missing_required_field_yields_one_issue_naming_it() {
        let issues = user_schema().validate(&json!({"name": "x"})).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, vec!["email"]);
        assert!(issues[0].message.contains("email"));
    }

    #[test]
    fn null_input_reports_every_required_field() {
        let issues = user_schema().validate(&Value::Null).unwrap_err();
        let paths: Vec<_> = issues.iter().flat_map(|i| i.path.clone()).collect();
        assert_eq!(paths, vec!["name", "email"]);
    }

    #[test]
    fn wrong_type_is_reported_per_field() {
        let issues = user_schema()
            .validate(&json!({"name": 42, "email": "x@example.com"}))
            .unwrap_err();
        assert_eq!(issues[0].path, vec!["name"]);
        assert!(issues[0].message.contains("string"));
    }

    #[test]
    fn non_object_input_is_a_single_root_issue() {
        let issues = user_schema().validate(&json!([1, 2])).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].path.is_empty());
    }

    #[test]
    fn length_and_pattern_rules_apply_to_the_last_field() {
        let schema = ObjectSchema::new()
            .required("id", FieldKind::String)
            .length(1, 8)
            .pattern("^[a-z0-9_]+$");

        assert!(schema.validate(&json!({"id": "abc_123"})).is_ok());
        assert!(schema.validate(&json!({"id": "way-too-long-for-this"})).is_err());
        assert!(schema.validate(&json!({"id": "UPPER"})).is_err());
    }

    #[test]
    fn typed_schema_reports_missing_fields_through_serde() {
        #[derive(Deserialize, Serialize)]
        struct CreateUser {
            name: String,
            email: String,
        }

        let schema = TypedSchema::<CreateUser>::new();
        assert!(schema.validate(&json!({"name": "x", "email": "y"})).is_ok());

        let issues = schema.validate(&json!({"name": "x"})).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("email"));
    }
}
