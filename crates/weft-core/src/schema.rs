use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Result, WeftError};

/// Primitive type of a top-level schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "string" | "str" | "text" => Some(Self::String),
            "number" | "float" | "double" => Some(Self::Number),
            "integer" | "int" => Some(Self::Integer),
            "boolean" | "bool" => Some(Self::Boolean),
            "object" | "map" => Some(Self::Object),
            "array" | "list" => Some(Self::Array),
            "any" | "json" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }

    /// Infer the type of a literal JSON value.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Any,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Whether a source field of type `source` satisfies this type without conversion.
    pub fn accepts(self, source: FieldType) -> bool {
        self == source
            || self == Self::Any
            || source == Self::Any
            || (self == Self::Number && source == Self::Integer)
    }

    /// Whether a value of type `source` can be converted into this type.
    pub fn coercible_from(self, source: FieldType) -> bool {
        matches!(
            (source, self),
            (Self::String, Self::Number | Self::Integer | Self::Boolean)
                | (Self::Number | Self::Integer | Self::Boolean, Self::String)
                | (Self::Number, Self::Integer)
        )
    }

    /// Runtime check of a concrete value against this type.
    pub fn matches_value(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one top-level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(ty: FieldType) -> Self {
        Self {
            ty,
            required: true,
            aliases: vec![],
            default: None,
        }
    }

    pub fn optional(ty: FieldType) -> Self {
        Self {
            ty,
            required: false,
            aliases: vec![],
            default: None,
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Hex SHA-256 digest of a schema's canonical JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaHash(pub String);

impl fmt::Display for SchemaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A JSON-schema-like descriptor of an object's top-level fields.
///
/// Accepts standard JSON Schema (`type`/`properties`/`required`, with
/// per-property `aliases` or `x-aliases` and `default`) as well as the
/// shorthand `{"field": "type"}` where a trailing `?` marks the field optional.
/// Serializes back to standard JSON Schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct SchemaDescriptor {
    fields: BTreeMap<String, FieldSpec>,
}

impl SchemaDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn required(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with_field(name, FieldSpec::required(ty))
    }

    pub fn optional(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with_field(name, FieldSpec::optional(ty))
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldSpec> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn required_fields(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.fields.iter().filter(|(_, spec)| spec.required)
    }

    /// Parse either the JSON Schema or the shorthand form.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(obj) if is_json_schema(obj) => Self::from_json_schema(obj),
            Value::Object(obj) => Self::from_shorthand(obj),
            other => Err(WeftError::Schema(format!(
                "expected a schema object, got {}",
                FieldType::of_value(other)
            ))),
        }
    }

    fn from_json_schema(obj: &Map<String, Value>) -> Result<Self> {
        let required: BTreeSet<&str> = obj
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        let mut fields = BTreeMap::new();
        if let Some(props) = obj.get("properties") {
            let props = props
                .as_object()
                .ok_or_else(|| WeftError::Schema("'properties' must be an object".into()))?;
            for (name, prop) in props {
                let mut spec = parse_property(name, prop)?;
                spec.required = required.contains(name.as_str());
                fields.insert(name.clone(), spec);
            }
        }

        for name in &required {
            if !fields.contains_key(*name) {
                fields.insert(name.to_string(), FieldSpec::required(FieldType::Any));
            }
        }

        Ok(Self { fields })
    }

    fn from_shorthand(obj: &Map<String, Value>) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for (name, decl) in obj {
            let spec = match decl {
                Value::String(s) => {
                    let (ty_str, required) = match s.strip_suffix('?') {
                        Some(rest) => (rest, false),
                        None => (s.as_str(), true),
                    };
                    let ty = FieldType::parse(ty_str).ok_or_else(|| {
                        WeftError::Schema(format!("unknown type '{}' for field '{}'", ty_str, name))
                    })?;
                    FieldSpec {
                        ty,
                        required,
                        aliases: vec![],
                        default: None,
                    }
                }
                Value::Object(prop) => {
                    let mut spec = parse_property(name, decl)?;
                    spec.required = prop
                        .get("required")
                        .and_then(|r| r.as_bool())
                        .unwrap_or(true);
                    spec
                }
                other => {
                    return Err(WeftError::Schema(format!(
                        "field '{}' must be a type name or object, got {}",
                        name,
                        FieldType::of_value(other)
                    )))
                }
            };
            fields.insert(name.clone(), spec);
        }
        Ok(Self { fields })
    }

    /// Render as standard JSON Schema.
    pub fn to_json(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.fields {
            let mut prop = Map::new();
            prop.insert("type".into(), Value::String(spec.ty.as_str().into()));
            if !spec.aliases.is_empty() {
                prop.insert(
                    "aliases".into(),
                    Value::Array(spec.aliases.iter().cloned().map(Value::String).collect()),
                );
            }
            if let Some(ref default) = spec.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(name.clone(), Value::Object(prop));
            if spec.required {
                required.push(Value::String(name.clone()));
            }
        }

        let mut schema = Map::new();
        schema.insert("type".into(), Value::String("object".into()));
        schema.insert("properties".into(), Value::Object(properties));
        schema.insert("required".into(), Value::Array(required));
        Value::Object(schema)
    }

    /// Stable content hash, used as a cache key.
    pub fn hash(&self) -> SchemaHash {
        let canonical = self.to_json().to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        SchemaHash(hex::encode(digest))
    }

    /// Describe the shape of a literal value. Scalars are exposed as `text`.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Object(obj) => Self {
                fields: obj
                    .iter()
                    .map(|(k, v)| (k.clone(), FieldSpec::required(FieldType::of_value(v))))
                    .collect(),
            },
            Value::Null => Self::default(),
            scalar => Self::default().required("text", FieldType::of_value(scalar)),
        }
    }

    /// Union of several schemas; the first declaration of a field wins.
    pub fn union<'a>(schemas: impl IntoIterator<Item = &'a SchemaDescriptor>) -> Self {
        let mut fields = BTreeMap::new();
        for schema in schemas {
            for (name, spec) in &schema.fields {
                fields.entry(name.clone()).or_insert_with(|| spec.clone());
            }
        }
        Self { fields }
    }

    /// Copy of this schema keeping only the fields `keep` accepts.
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> Self {
        let fields = self
            .fields
            .iter()
            .filter(|(name, _)| keep(name.as_str()))
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect();
        Self { fields }
    }

    /// Check a concrete value against the declared fields.
    ///
    /// Returns every issue found; extra fields are allowed.
    pub fn validate_instance(&self, value: &Value) -> std::result::Result<(), Vec<String>> {
        let Some(obj) = value.as_object() else {
            return Err(vec![format!(
                "expected an object, got {}",
                FieldType::of_value(value)
            )]);
        };

        let mut issues = Vec::new();
        for (name, spec) in &self.fields {
            match obj.get(name) {
                Some(v) if !v.is_null() => {
                    if !spec.ty.matches_value(v) {
                        issues.push(format!(
                            "field '{}' should be {}, got {}",
                            name,
                            spec.ty,
                            FieldType::of_value(v)
                        ));
                    }
                }
                _ if spec.required => issues.push(format!("missing required field '{}'", name)),
                _ => {}
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Keys that belong to an object-level JSON Schema rather than to a field.
const SCHEMA_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "title",
    "description",
    "type",
    "properties",
    "required",
    "additionalProperties",
    "examples",
];

/// JSON Schema needs an object `properties` or `"type": "object"`, and no
/// other key may read as a shorthand field declaration.
fn is_json_schema(obj: &Map<String, Value>) -> bool {
    let properties_ok = obj.get("properties").map_or(true, Value::is_object);
    let declared = obj.get("properties").is_some_and(Value::is_object)
        || obj.get("type").is_some_and(|t| t == "object");
    declared
        && properties_ok
        && !obj
            .iter()
            .any(|(key, decl)| !SCHEMA_KEYWORDS.contains(&key.as_str()) && is_field_decl(decl))
}

fn is_field_decl(decl: &Value) -> bool {
    match decl {
        Value::String(s) => FieldType::parse(s.strip_suffix('?').unwrap_or(s.as_str())).is_some(),
        Value::Object(prop) => prop.get("type").is_some_and(Value::is_string),
        _ => false,
    }
}

fn parse_property(name: &str, prop: &Value) -> Result<FieldSpec> {
    let Some(obj) = prop.as_object() else {
        return Err(WeftError::Schema(format!("property '{}' must be an object", name)));
    };

    let ty = match obj.get("type") {
        None => FieldType::Any,
        Some(Value::String(s)) => FieldType::parse(s).ok_or_else(|| {
            WeftError::Schema(format!("unknown type '{}' for field '{}'", s, name))
        })?,
        // ["string", "null"] style unions: take the first non-null member
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(|t| t.as_str())
            .filter(|t| *t != "null")
            .find_map(FieldType::parse)
            .unwrap_or(FieldType::Any),
        Some(other) => {
            return Err(WeftError::Schema(format!(
                "invalid type declaration for field '{}': {}",
                name, other
            )))
        }
    };

    let aliases = obj
        .get("aliases")
        .or_else(|| obj.get("x-aliases"))
        .and_then(|a| a.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(FieldSpec {
        ty,
        required: false,
        aliases,
        default: obj.get("default").cloned(),
    })
}

impl TryFrom<Value> for SchemaDescriptor {
    type Error = WeftError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_json(&value)
    }
}

impl From<SchemaDescriptor> for Value {
    fn from(schema: SchemaDescriptor) -> Self {
        schema.to_json()
    }
}
