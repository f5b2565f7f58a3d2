// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outgoing event records.
//!
//! Shape of a stored event:
//! ```json
//! {
//!   "event": "checkout",
//!   "prop": { "mp_lib": "rust", "$os": "linux", "token": "...", "service_name": "...", ... },
//!   "$mp_metadata": { ... }
//! }
//! ```
//! Caller properties are merged over the defaults, so a caller can override
//! any default including the stamped project identifiers.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::command::EventMessage;
use crate::storage::PROPERTIES_KEY;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("properties for '{event}' must be a JSON object, got {found}")]
    PropertiesNotObject { event: String, found: &'static str },
    #[error("payload must be a JSON object, got {0}")]
    NotObject(&'static str),
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Require a people/group payload to be a JSON object.
pub(crate) fn require_object(payload: &Value) -> Result<&Map<String, Value>, PayloadError> {
    payload
        .as_object()
        .ok_or_else(|| PayloadError::NotObject(json_type(payload)))
}

/// Builds stored event records from [`EventMessage`]s.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    defaults: Map<String, Value>,
}

impl EventBuilder {
    /// Library defaults plus `extra` (host-collected device metadata).
    #[must_use]
    pub fn new(extra: &Map<String, Value>) -> Self {
        let mut defaults = Map::new();
        defaults.insert("mp_lib".into(), Value::from("rust"));
        defaults.insert("$lib_version".into(), Value::from(env!("CARGO_PKG_VERSION")));
        defaults.insert("$os".into(), Value::from(std::env::consts::OS));
        defaults.insert("$os_version".into(), Value::from("UNKNOWN"));
        for (key, value) in extra {
            defaults.insert(key.clone(), value.clone());
        }
        Self { defaults }
    }

    #[must_use]
    pub fn defaults(&self) -> &Map<String, Value> {
        &self.defaults
    }

    pub fn build(&self, event: &EventMessage) -> Result<Value, PayloadError> {
        let mut properties = self.defaults.clone();
        properties.insert("token".into(), Value::from(event.token.as_str()));
        properties.insert("service_name".into(), Value::from(event.service_name.as_str()));

        match &event.properties {
            Value::Null => {}
            Value::Object(caller) => {
                for (key, value) in caller {
                    properties.insert(key.clone(), value.clone());
                }
            }
            other => {
                return Err(PayloadError::PropertiesNotObject {
                    event: event.name.clone(),
                    found: json_type(other),
                })
            }
        }

        let mut record = Map::new();
        record.insert("event".into(), Value::from(event.name.as_str()));
        record.insert(PROPERTIES_KEY.into(), Value::Object(properties));
        record.insert("$mp_metadata".into(), Value::Object(event.session_metadata.clone()));
        Ok(Value::Object(record))
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new(&Map::new())
    }
}
