//! Payload validation.
//!
//! A job's schema is its input type: decoding untyped JSON into `T` checks
//! structure and `validator::Validate` checks the field rules. The enqueued
//! payload is the re-encoded `T`, so unknown fields are dropped.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use validator::Validate;

use crate::error::SchemaViolation;

/// Types usable as job input.
pub trait Payload: Serialize + DeserializeOwned + Validate + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Validate + Send + Sync + 'static {}

/// Decode and validate `value` as `T`.
pub fn check<T: Payload>(value: &Value) -> Result<T, SchemaViolation> {
    let typed = T::deserialize(value).map_err(SchemaViolation::Decode)?;
    typed.validate().map_err(SchemaViolation::Rules)?;
    Ok(typed)
}

/// Validate `value` as `T` and return its canonical JSON form.
pub fn normalize<T: Payload>(value: &Value) -> Result<Value, SchemaViolation> {
    let typed: T = check(value)?;
    serde_json::to_value(&typed).map_err(SchemaViolation::Decode)
}

/// Encode a typed payload for validation.
pub fn encode<T: Payload>(payload: &T) -> Result<Value, SchemaViolation> {
    serde_json::to_value(payload).map_err(SchemaViolation::Decode)
}
