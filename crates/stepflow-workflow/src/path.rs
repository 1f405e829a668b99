//! Field-path extraction and payload shaping between states
//!
//! Paths use the `$`-rooted subset of JSONPath the state language accepts for
//! plain field selection: `$`, `$.a.b`, `$.items[0].id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Invalid field path '{path}': {reason}")]
    Invalid { path: String, reason: String },

    #[error("Field path '{path}' did not match any value in the payload")]
    Missing { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// Parsed `$`-rooted path into a JSON document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// The whole document
    pub fn root() -> Self {
        Self {
            raw: "$".to_string(),
            segments: Vec::new(),
        }
    }

    pub fn parse(path: &str) -> Result<Self, PathError> {
        let invalid = |reason: &str| PathError::Invalid {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let rest = path
            .strip_prefix('$')
            .ok_or_else(|| invalid("must start with '$'"))?;

        let mut segments = Vec::new();
        let mut chars = rest.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    let mut name = String::new();
                    while let Some(&next) = chars.peek() {
                        if next == '.' || next == '[' {
                            break;
                        }
                        name.push(next);
                        chars.next();
                    }
                    if name.is_empty() {
                        return Err(invalid("empty field name"));
                    }
                    segments.push(Segment::Field(name));
                }
                '[' => {
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(d) if d.is_ascii_digit() => digits.push(d),
                            Some(_) => return Err(invalid("array index must be a number")),
                            None => return Err(invalid("unterminated '['")),
                        }
                    }
                    let index = digits
                        .parse::<usize>()
                        .map_err(|_| invalid("empty array index"))?;
                    segments.push(Segment::Index(index));
                }
                _ => return Err(invalid("expected '.' or '['")),
            }
        }

        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Value at this path, if present
    pub fn extract<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;

        for segment in &self.segments {
            current = match segment {
                Segment::Field(name) => current.get(name.as_str())?,
                Segment::Index(index) => current.get(*index)?,
            };
        }

        Some(current)
    }

    /// Value at this path, or a [`PathError::Missing`]
    pub fn require<'a>(&self, value: &'a Value) -> Result<&'a Value, PathError> {
        self.extract(value).ok_or_else(|| PathError::Missing {
            path: self.raw.clone(),
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

/// One named field copied into a shaped payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectField {
    pub name: String,
    pub path: FieldPath,
}

/// How a state's input and result become the next state's input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadShaping {
    /// Next input is the current state's input, untouched
    PassThrough,
    /// Next input is the result (or error document) produced by the state
    Result,
    /// Next input is a new object built from fields of the result
    Select { fields: Vec<SelectField> },
}

impl PayloadShaping {
    /// Keep only `name`, read from `path` of the result
    pub fn select(name: impl Into<String>, path: FieldPath) -> Self {
        Self::Select {
            fields: vec![SelectField {
                name: name.into(),
                path,
            }],
        }
    }

    pub fn apply(&self, input: &Value, result: &Value) -> Result<Value, PathError> {
        match self {
            PayloadShaping::PassThrough => Ok(input.clone()),
            PayloadShaping::Result => Ok(result.clone()),
            PayloadShaping::Select { fields } => {
                let mut map = serde_json::Map::new();
                for field in fields {
                    let value = field.path.require(result)?;
                    map.insert(field.name.clone(), value.clone());
                }
                Ok(Value::Object(map))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_extract() {
        let doc = json!({
            "detail": {"object": {"key": "reports/jan.txt"}},
            "resources": ["arn:aws:s3:::bucket"]
        });

        let key = FieldPath::parse("$.detail.object.key").unwrap();
        assert_eq!(key.extract(&doc), Some(&json!("reports/jan.txt")));

        let resource = FieldPath::parse("$.resources[0]").unwrap();
        assert_eq!(resource.extract(&doc), Some(&json!("arn:aws:s3:::bucket")));

        assert_eq!(FieldPath::root().extract(&doc), Some(&doc));
        assert!(FieldPath::parse("$.detail.missing").unwrap().extract(&doc).is_none());
    }

    #[test]
    fn test_field_names_with_dashes() {
        let doc = json!({"detail-type": "Object Created"});
        let path = FieldPath::parse("$.detail-type").unwrap();
        assert_eq!(path.extract(&doc), Some(&json!("Object Created")));
    }

    #[test]
    fn test_invalid_paths() {
        assert!(FieldPath::parse("Cause").is_err());
        assert!(FieldPath::parse("$.").is_err());
        assert!(FieldPath::parse("$..Cause").is_err());
        assert!(FieldPath::parse("$.items[x]").is_err());
        assert!(FieldPath::parse("$.items[0").is_err());
        assert!(FieldPath::parse("$Cause").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let path: FieldPath = serde_json::from_value(json!("$.Cause")).unwrap();
        assert_eq!(path.as_str(), "$.Cause");
        assert_eq!(serde_json::to_value(&path).unwrap(), json!("$.Cause"));

        let bad: Result<FieldPath, _> = serde_json::from_value(json!("Cause"));
        assert!(bad.is_err());
    }

    #[test]
    fn test_select_discards_other_error_fields() {
        let shaping = PayloadShaping::select("Cause", FieldPath::parse("$.Cause").unwrap());
        let error = json!({"Error": "ZeroDivisionError", "Cause": "division by zero", "Trace": []});

        let shaped = shaping.apply(&json!({"input": true}), &error).unwrap();
        assert_eq!(shaped, json!({"Cause": "division by zero"}));
    }

    #[test]
    fn test_select_missing_field() {
        let shaping = PayloadShaping::select("Cause", FieldPath::parse("$.Cause").unwrap());
        let err = shaping.apply(&json!({}), &json!({"Error": "x"})).unwrap_err();
        assert_eq!(
            err,
            PathError::Missing {
                path: "$.Cause".to_string()
            }
        );
    }

    #[test]
    fn test_pass_through_and_result() {
        let input = json!({"a": 1});
        let result = json!({"b": 2});
        assert_eq!(PayloadShaping::PassThrough.apply(&input, &result).unwrap(), input);
        assert_eq!(PayloadShaping::Result.apply(&input, &result).unwrap(), result);
    }
}
