//! Opaque structured values for resource inputs and outputs
//!
//! Provider schemas are dynamic, so resource payloads are modeled as a tagged
//! union of primitives, arrays, and maps rather than fixed record types. Two
//! extra variants carry engine semantics:
//!
//! - [`Value::Secret`] wraps a value whose plaintext must never appear in
//!   rendered output or logs. Secrets round-trip through state intact.
//! - [`Value::Output`] embeds a reference to another resource's output field.
//!   References are scanned at graph-build time to produce dependency edges
//!   and resolved against committed outputs just before dispatch.
//!
//! The JSON encoding uses single-key sentinel objects (`"$secret"`, `"$ref"`)
//! so values survive a write-then-read of the state file byte-for-byte. Map
//! keys beginning with `$` are reserved for the engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Sentinel key marking a secret-wrapped value in the JSON encoding
const KEY_SECRET: &str = "$secret";

/// Sentinel key marking an output reference in the JSON encoding
const KEY_REF: &str = "$ref";

/// A reference to another resource's output field
///
/// Embedded inside a desired-state payload, this is a placeholder that
/// resolves to the referenced resource's output once that resource commits.
/// It is also the source of implicit dependency edges.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputRef {
    /// Logical name of the referenced resource
    pub resource: String,
    /// Output field to read once the resource has committed
    pub field: String,
}

impl OutputRef {
    /// Create a new output reference
    pub fn new(resource: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.field)
    }
}

/// An opaque structured value
///
/// The engine never interprets resource payloads beyond reference scanning
/// and equality; their meaning belongs to the provider.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent/null
    Null,
    /// Boolean
    Bool(bool),
    /// Number (arbitrary JSON number, preserved exactly)
    Number(serde_json::Number),
    /// UTF-8 string
    String(String),
    /// Ordered list
    Array(Vec<Value>),
    /// String-keyed map with deterministic ordering
    Map(BTreeMap<String, Value>),
    /// A value whose plaintext is redacted from all rendered output
    Secret(Box<Value>),
    /// A placeholder for another resource's output field
    Output(OutputRef),
}

impl Value {
    /// Create a string value
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Wrap a value as secret
    pub fn secret(inner: impl Into<Value>) -> Self {
        Self::Secret(Box::new(inner.into()))
    }

    /// Create an output reference value
    pub fn reference(resource: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Output(OutputRef::new(resource, field))
    }

    /// Build a map value from key/value pairs
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Get a field of a map value, looking through a secret wrapper
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Map(m) => m.get(key),
            Self::Secret(inner) => inner.get(key),
            _ => None,
        }
    }

    /// Borrow the string contents, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the boolean contents, if this is a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Collect every output reference embedded in this value
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Output(r) => refs.push(r),
            Self::Array(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Self::Map(entries) => {
                for v in entries.values() {
                    v.collect_references(refs);
                }
            }
            Self::Secret(inner) => inner.collect_references(refs),
            _ => {}
        }
    }

    /// True if this value contains a secret anywhere in its tree
    pub fn has_secrets(&self) -> bool {
        match self {
            Self::Secret(_) => true,
            Self::Array(items) => items.iter().any(Value::has_secrets),
            Self::Map(entries) => entries.values().any(Value::has_secrets),
            _ => false,
        }
    }

    /// Replace every embedded output reference with the referenced output
    ///
    /// `outputs` maps committed resource names to their output values. Fails
    /// with [`Error::UnresolvedReference`] if a referenced resource or field
    /// is absent.
    pub fn resolve(&self, outputs: &BTreeMap<String, Value>) -> Result<Value, Error> {
        match self {
            Self::Output(r) => outputs
                .get(&r.resource)
                .and_then(|o| o.get(&r.field))
                .cloned()
                .ok_or_else(|| Error::UnresolvedReference {
                    resource: r.resource.clone(),
                    field: r.field.clone(),
                }),
            Self::Array(items) => items
                .iter()
                .map(|item| item.resolve(outputs))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| v.resolve(outputs).map(|v| (k.clone(), v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Map),
            Self::Secret(inner) => inner.resolve(outputs).map(Value::secret),
            other => Ok(other.clone()),
        }
    }

    /// Like [`resolve`](Self::resolve), but leaves unresolvable references
    /// in place instead of failing
    ///
    /// Used at planning time, when referenced resources may not have been
    /// created yet; the strict form runs again at dispatch time.
    pub fn resolve_lenient(&self, outputs: &BTreeMap<String, Value>) -> Value {
        match self {
            Self::Output(r) => outputs
                .get(&r.resource)
                .and_then(|o| o.get(&r.field))
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Self::Array(items) => {
                Value::Array(items.iter().map(|i| i.resolve_lenient(outputs)).collect())
            }
            Self::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve_lenient(outputs)))
                    .collect(),
            ),
            Self::Secret(inner) => Value::secret(inner.resolve_lenient(outputs)),
            other => other.clone(),
        }
    }

    /// Convert to the JSON encoding used by state files and the wire protocol
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Secret(inner) => {
                let mut obj = serde_json::Map::with_capacity(1);
                obj.insert(KEY_SECRET.to_string(), inner.to_json());
                serde_json::Value::Object(obj)
            }
            Self::Output(r) => {
                let mut target = serde_json::Map::with_capacity(2);
                target.insert(
                    "resource".to_string(),
                    serde_json::Value::String(r.resource.clone()),
                );
                target.insert(
                    "field".to_string(),
                    serde_json::Value::String(r.field.clone()),
                );
                let mut obj = serde_json::Map::with_capacity(1);
                obj.insert(KEY_REF.to_string(), serde_json::Value::Object(target));
                serde_json::Value::Object(obj)
            }
        }
    }

    /// Parse a value from its JSON encoding
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.clone()),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => {
                if obj.len() == 1 {
                    if let Some(inner) = obj.get(KEY_SECRET) {
                        return Self::secret(Value::from_json(inner));
                    }
                    if let Some(target) = obj.get(KEY_REF) {
                        if let (Some(resource), Some(field)) = (
                            target.get("resource").and_then(serde_json::Value::as_str),
                            target.get("field").and_then(serde_json::Value::as_str),
                        ) {
                            return Self::reference(resource, field);
                        }
                    }
                }
                Self::Map(
                    obj.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        if let serde_json::Value::Object(obj) = &json {
            if obj.len() == 1 {
                if let Some(target) = obj.get(KEY_REF) {
                    if target.get("resource").and_then(serde_json::Value::as_str).is_none()
                        || target.get("field").and_then(serde_json::Value::as_str).is_none()
                    {
                        return Err(D::Error::custom(
                            "\"$ref\" must carry string fields \"resource\" and \"field\"",
                        ));
                    }
                }
            }
        }
        Ok(Value::from_json(&json))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<OutputRef> for Value {
    fn from(r: OutputRef) -> Self {
        Self::Output(r)
    }
}

impl fmt::Display for Value {
    /// Render the value for humans. Secret contents are replaced with
    /// `[secret]`; the plaintext never reaches the formatter.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Secret(_) => write!(f, "[secret]"),
            Self::Output(r) => write!(f, "{r}"),
        }
    }
}
