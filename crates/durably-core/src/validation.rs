//! Runtime validation of job input/output payloads.
//!
//! A `Validator<T>` is deliberately narrower than `serde::Deserialize`: it
//! takes ownership of a `serde_json::Value` and hands back either a parsed
//! `T` or a human-readable rejection reason, the same `safeParse`-style
//! contract schema libraries in the wider ecosystem expose.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

pub trait Validator<T>: Send + Sync {
    fn safe_parse(&self, value: Value) -> Result<T, ValidationError>;
}

/// The default validator: structural `serde` deserialization with no
/// additional semantic checks. Sufficient for jobs whose input type is
/// already a precise enough contract.
pub struct SerdeValidator<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeValidator<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeValidator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Send + Sync> Validator<T> for SerdeValidator<T> {
    fn safe_parse(&self, value: Value) -> Result<T, ValidationError> {
        serde_json::from_value(value).map_err(|err| ValidationError {
            message: err.to_string(),
        })
    }
}

/// Wraps a plain closure as a `Validator`, for jobs that need semantic
/// checks (ranges, enums, cross-field rules) beyond what `serde` enforces
/// structurally.
pub struct FnValidator<T, F> {
    func: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> FnValidator<T, F>
where
    F: Fn(Value) -> Result<T, ValidationError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

impl<T, F> Validator<T> for FnValidator<T, F>
where
    T: Send + Sync,
    F: Fn(Value) -> Result<T, ValidationError> + Send + Sync,
{
    fn safe_parse(&self, value: Value) -> Result<T, ValidationError> {
        (self.func)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        count: i64,
    }

    #[test]
    fn serde_validator_parses_matching_shape() {
        let validator = SerdeValidator::<Payload>::new();
        let parsed = validator
            .safe_parse(serde_json::json!({ "count": 3 }))
            .unwrap();
        assert_eq!(parsed, Payload { count: 3 });
    }

    #[test]
    fn serde_validator_rejects_mismatched_shape() {
        let validator = SerdeValidator::<Payload>::new();
        let err = validator.safe_parse(serde_json::json!({})).unwrap_err();
        assert!(!err.message.is_empty());
    }

    #[test]
    fn fn_validator_enforces_semantic_rule() {
        let validator = FnValidator::new(|value: Value| {
            let count = value
                .get("count")
                .and_then(Value::as_i64)
                .ok_or_else(|| ValidationError {
                    message: "count is required".to_string(),
                })?;
            if count < 0 {
                return Err(ValidationError {
                    message: "count must be non-negative".to_string(),
                });
            }
            Ok(count)
        });
        assert!(validator.safe_parse(serde_json::json!({"count": -1})).is_err());
        assert_eq!(validator.safe_parse(serde_json::json!({"count": 2})).unwrap(), 2);
    }
}
