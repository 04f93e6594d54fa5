//! Value codec.
//!
//! Node values are stored as [`serde_json::Value`]. Null is never stored:
//! encoding null yields `None`, and an absent value decodes as null.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::SignalError;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Option<Value>, SignalError> {
    match serde_json::to_value(value)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

pub fn decode<T: DeserializeOwned>(value: Option<&Value>) -> Result<T, SignalError> {
    match value {
        Some(value) => Ok(T::deserialize(value)?),
        None => Ok(T::deserialize(&Value::Null)?),
    }
}
