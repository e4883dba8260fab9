use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::schema::FieldType;

/// How a target field was located in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Alias,
    Coercion,
}

impl Default for MatchKind {
    fn default() -> Self {
        Self::Exact
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Alias => write!(f, "alias"),
            Self::Coercion => write!(f, "coercion"),
        }
    }
}

/// Where one target field's value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSource {
    Field {
        field: String,
        #[serde(default)]
        via: MatchKind,
        /// Convert the source value to this type when applying.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coerce: Option<FieldType>,
    },
    Literal {
        literal: Value,
    },
}

impl FieldSource {
    pub fn field(name: impl Into<String>, via: MatchKind) -> Self {
        Self::Field {
            field: name.into(),
            via,
            coerce: None,
        }
    }

    pub fn literal(value: Value) -> Self {
        Self::Literal { literal: value }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot coerce field '{field}' from {from} to {to}: {reason}")]
pub struct CoercionError {
    pub field: String,
    pub from: FieldType,
    pub to: FieldType,
    pub reason: String,
}

/// Target field name -> source of its value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping(pub BTreeMap<String, FieldSource>);

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: impl Into<String>, source: FieldSource) {
        self.0.insert(target.into(), source);
    }

    pub fn get(&self, target: &str) -> Option<&FieldSource> {
        self.0.get(target)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldSource)> {
        self.0.iter()
    }

    /// Build the target object from a source object.
    ///
    /// Source fields that are absent (or null) are skipped; the caller decides
    /// whether the resulting gap is fatal. Literals are always emitted.
    pub fn apply(&self, source: &Value) -> Result<Map<String, Value>, CoercionError> {
        let empty = Map::new();
        let src = source.as_object().unwrap_or(&empty);
        let mut out = Map::new();

        for (target, from) in &self.0 {
            match from {
                FieldSource::Literal { literal } => {
                    out.insert(target.clone(), literal.clone());
                }
                FieldSource::Field { field, coerce, .. } => {
                    let Some(value) = src.get(field).filter(|v| !v.is_null()) else {
                        continue;
                    };
                    let value = match coerce {
                        Some(ty) => coerce_value(field, value, *ty)?,
                        None => value.clone(),
                    };
                    out.insert(target.clone(), value);
                }
            }
        }
        Ok(out)
    }
}

impl FromIterator<(String, FieldSource)> for FieldMapping {
    fn from_iter<I: IntoIterator<Item = (String, FieldSource)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Convert a single value to `to`, following the coercion rules the matcher scores.
pub fn coerce_value(field: &str, value: &Value, to: FieldType) -> Result<Value, CoercionError> {
    let from = FieldType::of_value(value);
    if to.matches_value(value) && !(to == FieldType::Integer && value.is_f64()) {
        return Ok(value.clone());
    }

    let fail = |reason: &str| CoercionError {
        field: field.to_string(),
        from,
        to,
        reason: reason.to_string(),
    };

    match (value, to) {
        (Value::String(s), FieldType::Number) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| fail("not a numeric string")),
        (Value::String(s), FieldType::Integer) => s
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| fail("not an integer string")),
        (Value::String(s), FieldType::Boolean) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(fail("not a boolean string")),
        },
        (Value::Number(n), FieldType::String) => Ok(Value::String(n.to_string())),
        (Value::Bool(b), FieldType::String) => Ok(Value::String(b.to_string())),
        (Value::Number(n), FieldType::Integer) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Ok(Value::Number((f as i64).into()))
            }
            _ => Err(fail("number has a fractional part")),
        },
        _ => Err(fail("no conversion rule")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_source_serde_shapes() {
        let src: FieldSource = serde_json::from_value(json!({"field": "summary", "via": "alias"})).unwrap();
        assert_eq!(src, FieldSource::field("summary", MatchKind::Alias));

        let lit: FieldSource = serde_json::from_value(json!({"literal": "en"})).unwrap();
        assert_eq!(lit, FieldSource::literal(json!("en")));

        let bare: FieldSource = serde_json::from_value(json!({"field": "text"})).unwrap();
        assert_eq!(bare, FieldSource::field("text", MatchKind::Exact));
    }

    #[test]
    fn apply_renames_and_fills_literals() {
        let mut mapping = FieldMapping::new();
        mapping.insert("text", FieldSource::field("summary", MatchKind::Alias));
        mapping.insert("lang", FieldSource::literal(json!("en")));
        mapping.insert("missing", FieldSource::field("nowhere", MatchKind::Exact));

        let out = mapping.apply(&json!({"summary": "short", "extra": 1})).unwrap();
        assert_eq!(Value::Object(out), json!({"text": "short", "lang": "en"}));
    }

    #[test]
    fn apply_coerces() {
        let mut mapping = FieldMapping::new();
        mapping.insert(
            "score",
            FieldSource::Field {
                field: "score".into(),
                via: MatchKind::Coercion,
                coerce: Some(FieldType::Number),
            },
        );
        let out = mapping.apply(&json!({"score": "0.75"})).unwrap();
        assert_eq!(out["score"], json!(0.75));

        let err = mapping.apply(&json!({"score": "high"})).unwrap_err();
        assert_eq!(err.field, "score");
        assert_eq!(err.to, FieldType::Number);
    }

    #[test]
    fn coercion_rules() {
        assert_eq!(coerce_value("n", &json!(3.0), FieldType::Integer).unwrap(), json!(3));
        assert!(coerce_value("n", &json!(3.5), FieldType::Integer).is_err());
        assert_eq!(coerce_value("b", &json!("yes"), FieldType::Boolean).unwrap(), json!(true));
        assert_eq!(coerce_value("s", &json!(42), FieldType::String).unwrap(), json!("42"));
        assert!(coerce_value("o", &json!({"a": 1}), FieldType::String).is_err());
    }
}
