//! Typed parameter descriptors and the coercion step.
//!
//! Handlers never see raw JSON blobs: the dispatcher coerces every supplied
//! argument against the tool's declared schema and hands over an [`Args`]
//! map of already-validated values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use waggle_types::{HubError, HubResult};

/// Declared type of one tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    List,
    Map,
}

impl ParamType {
    fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
            ParamType::List => "list",
            ParamType::Map => "map",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, ty: ParamType, default: JsonValue) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: Some(default),
        }
    }
}

/// Coerced arguments, ready for a handler.
#[derive(Debug, Clone, Default)]
pub struct Args(BTreeMap<String, JsonValue>);

impl Args {
    /// Coerce a raw `args` JSON value against the declared parameters.
    ///
    /// Missing required parameters and type mismatches are `BadArgument`;
    /// unknown names are dropped with a warning.
    pub fn coerce(tool: &str, params: &[ParamSpec], raw: JsonValue) -> HubResult<Self> {
        let supplied = match raw {
            JsonValue::Null => serde_json::Map::new(),
            JsonValue::Object(map) => map,
            other => {
                return Err(HubError::BadArgument(format!(
                    "args must be an object, got {}",
                    json_type_name(&other)
                )));
            }
        };

        for key in supplied.keys() {
            if !params.iter().any(|p| p.name == *key) {
                warn!(tool, arg = %key, "ignoring unknown tool argument");
            }
        }

        let mut out = BTreeMap::new();
        for param in params {
            match supplied.get(&param.name) {
                Some(value) if !value.is_null() => {
                    let coerced = coerce_value(value, param.ty).ok_or_else(|| {
                        HubError::BadArgument(format!(
                            "argument '{}' expects {}, got {}",
                            param.name,
                            param.ty.name(),
                            json_type_name(value)
                        ))
                    })?;
                    out.insert(param.name.clone(), coerced);
                }
                _ => {
                    if let Some(default) = &param.default {
                        out.insert(param.name.clone(), default.clone());
                    } else if param.required {
                        return Err(HubError::BadArgument(format!(
                            "missing required argument '{}'",
                            param.name
                        )));
                    }
                }
            }
        }
        Ok(Self(out))
    }

    /// Build from already-typed values (tests, internal calls).
    pub fn from_map(map: BTreeMap<String, JsonValue>) -> Self {
        Self(map)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.0.get(name)
    }

    /// Required string. Coercion guarantees presence for required params;
    /// a miss here is a registration bug surfaced as `BadArgument`.
    pub fn str(&self, name: &str) -> HubResult<&str> {
        self.get(name)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| HubError::BadArgument(format!("missing argument '{name}'")))
    }

    pub fn string(&self, name: &str) -> HubResult<String> {
        self.str(name).map(str::to_string)
    }

    pub fn opt_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(JsonValue::as_str)
    }

    pub fn int(&self, name: &str) -> HubResult<i64> {
        self.get(name)
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| HubError::BadArgument(format!("missing argument '{name}'")))
    }

    pub fn opt_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(JsonValue::as_i64)
    }

    pub fn float(&self, name: &str) -> HubResult<f64> {
        self.get(name)
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| HubError::BadArgument(format!("missing argument '{name}'")))
    }

    pub fn bool(&self, name: &str) -> HubResult<bool> {
        self.get(name)
            .and_then(JsonValue::as_bool)
            .ok_or_else(|| HubError::BadArgument(format!("missing argument '{name}'")))
    }

    pub fn opt_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(JsonValue::as_bool)
    }

    pub fn list(&self, name: &str) -> Option<&Vec<JsonValue>> {
        self.get(name).and_then(JsonValue::as_array)
    }

    /// String list helper: non-string elements are skipped.
    pub fn string_list(&self, name: &str) -> Vec<String> {
        self.list(name)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn map(&self, name: &str) -> Option<&serde_json::Map<String, JsonValue>> {
        self.get(name).and_then(JsonValue::as_object)
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Lossless coercion of a supplied value into the declared type.
fn coerce_value(value: &JsonValue, ty: ParamType) -> Option<JsonValue> {
    match ty {
        ParamType::String => match value {
            JsonValue::String(_) => Some(value.clone()),
            JsonValue::Number(n) => Some(JsonValue::String(n.to_string())),
            JsonValue::Bool(b) => Some(JsonValue::String(b.to_string())),
            _ => None,
        },
        ParamType::Int => match value {
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(JsonValue::from(i))
                } else {
                    // Accept floats with no fractional part.
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| JsonValue::from(f as i64))
                }
            }
            JsonValue::String(s) => s.parse::<i64>().ok().map(JsonValue::from),
            _ => None,
        },
        ParamType::Float => match value {
            JsonValue::Number(n) => n.as_f64().map(JsonValue::from),
            JsonValue::String(s) => s.parse::<f64>().ok().map(JsonValue::from),
            _ => None,
        },
        ParamType::Bool => match value {
            JsonValue::Bool(_) => Some(value.clone()),
            JsonValue::String(s) => match s.as_str() {
                "true" => Some(JsonValue::Bool(true)),
                "false" => Some(JsonValue::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ParamType::List => value.is_array().then(|| value.clone()),
        ParamType::Map => value.is_object().then(|| value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("content", ParamType::String),
            ParamSpec::with_default("limit", ParamType::Int, json!(20)),
            ParamSpec::optional("tags", ParamType::List),
            ParamSpec::with_default("semantic", ParamType::Bool, json!(true)),
        ]
    }

    #[test]
    fn test_missing_required_rejected() {
        let err = Args::coerce("t", &params(), json!({})).unwrap_err();
        assert!(matches!(err, HubError::BadArgument(_)));
    }

    #[test]
    fn test_defaults_applied() {
        let args = Args::coerce("t", &params(), json!({"content": "x"})).unwrap();
        assert_eq!(args.int("limit").unwrap(), 20);
        assert!(args.bool("semantic").unwrap());
        assert!(!args.contains("tags"));
    }

    #[test]
    fn test_string_coercion_from_number() {
        let args = Args::coerce("t", &params(), json!({"content": 42})).unwrap();
        assert_eq!(args.str("content").unwrap(), "42");
    }

    #[test]
    fn test_int_coercion() {
        let args = Args::coerce("t", &params(), json!({"content": "x", "limit": "7"})).unwrap();
        assert_eq!(args.int("limit").unwrap(), 7);

        let args = Args::coerce("t", &params(), json!({"content": "x", "limit": 7.0})).unwrap();
        assert_eq!(args.int("limit").unwrap(), 7);

        let err = Args::coerce("t", &params(), json!({"content": "x", "limit": 7.5})).unwrap_err();
        assert!(matches!(err, HubError::BadArgument(_)));
    }

    #[test]
    fn test_unknown_args_ignored() {
        let args =
            Args::coerce("t", &params(), json!({"content": "x", "mystery": 1})).unwrap();
        assert!(!args.contains("mystery"));
    }

    #[test]
    fn test_non_object_args_rejected() {
        let err = Args::coerce("t", &params(), json!([1, 2])).unwrap_err();
        assert!(matches!(err, HubError::BadArgument(_)));
    }

    #[test]
    fn test_null_args_treated_as_empty() {
        let err = Args::coerce("t", &params(), JsonValue::Null).unwrap_err();
        // Required param still missing.
        assert!(matches!(err, HubError::BadArgument(_)));
    }

    #[test]
    fn test_string_list_helper() {
        let args = Args::coerce(
            "t",
            &params(),
            json!({"content": "x", "tags": ["a", 1, "b"]}),
        )
        .unwrap();
        assert_eq!(args.string_list("tags"), vec!["a", "b"]);
    }
}
