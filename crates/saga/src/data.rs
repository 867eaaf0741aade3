//! Step-to-step saga context.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::{Result, SagaError};

/// Schema version written into every persisted context snapshot.
pub const CONTEXT_SCHEMA_VERSION: u64 = 1;

const VERSION_KEY: &str = "schema_version";
const DATA_KEY: &str = "data";

/// Mutable key/value context shared by the steps of one saga.
///
/// Persisted after every step as a versioned snapshot:
///
/// ```text
/// {"schema_version": 1, "data": {...}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaData {
    values: Map<String, Value>,
}

impl SagaData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a value.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder-style [`SagaData::put`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.put(key, value);
        self
    }

    /// Serializes `value` and stores it under `key`.
    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// Returns a boolean flag, treating a missing key as false.
    pub fn flag(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Deserializes the value under `key`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(SagaError::from)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Copies every entry of `other` over this context.
    pub fn merge(&mut self, other: SagaData) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Wraps the context in a versioned snapshot for persistence.
    pub fn to_snapshot(&self) -> Value {
        let mut snapshot = Map::new();
        snapshot.insert(VERSION_KEY.to_string(), Value::from(CONTEXT_SCHEMA_VERSION));
        snapshot.insert(DATA_KEY.to_string(), Value::Object(self.values.clone()));
        Value::Object(snapshot)
    }

    /// Restores a context from a persisted snapshot.
    ///
    /// A bare object without the version envelope is read as a version 1
    /// context. Snapshots from a newer schema are rejected untouched.
    pub fn from_snapshot(snapshot: &Value) -> Result<Self> {
        let Value::Object(object) = snapshot else {
            return Err(SagaError::InvalidContext(format!(
                "expected an object, found {snapshot}"
            )));
        };

        let Some(version) = object.get(VERSION_KEY) else {
            return Ok(Self {
                values: object.clone(),
            });
        };

        let version = version.as_u64().ok_or_else(|| {
            SagaError::InvalidContext(format!("schema_version is not an integer: {version}"))
        })?;
        if version > CONTEXT_SCHEMA_VERSION {
            return Err(SagaError::UnsupportedContextVersion {
                found: version,
                supported: CONTEXT_SCHEMA_VERSION,
            });
        }

        match object.get(DATA_KEY) {
            Some(Value::Object(values)) => Ok(Self {
                values: values.clone(),
            }),
            None => Ok(Self::default()),
            Some(other) => Err(SagaError::InvalidContext(format!(
                "data is not an object: {other}"
            ))),
        }
    }
}

impl From<Map<String, Value>> for SagaData {
    fn from(values: Map<String, Value>) -> Self {
        Self { values }
    }
}
