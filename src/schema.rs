//! # Schema Validation
//!
//! Every document write — PUT content or the final value of a PATCH
//! sequence — must satisfy the process-wide JSON schema before it becomes
//! observable. The schema is compiled once at startup from the file named by
//! the `-s` flag; compilation failure aborts startup.
//!
//! The compiled validator is immutable after construction and freely shared
//! across request handlers behind an `Arc`.

use std::path::Path;

use crate::error::{Error, Result};
use crate::json::JsonValue;

/// A compiled, process-wide JSON schema validator.
pub struct SchemaValidator {
    compiled: jsonschema::JSONSchema,
}

impl SchemaValidator {
    /// Reads and compiles the schema file.
    ///
    /// Fails with an I/O error when the file is unreadable and with
    /// [`Error::Schema`] when the contents do not compile.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let schema: serde_json::Value = serde_json::from_str(&text)?;
        Self::from_value(&schema)
    }

    /// Compiles a schema already parsed into a `serde_json::Value`.
    pub fn from_value(schema: &serde_json::Value) -> Result<Self> {
        let compiled = jsonschema::JSONSchema::compile(schema)
            .map_err(|err| Error::Schema(format!("schema does not compile: {err}")))?;
        Ok(SchemaValidator { compiled })
    }

    /// Validates a document value against the schema.
    ///
    /// Returns [`Error::Schema`] carrying the first validation failure.
    pub fn validate(&self, value: &JsonValue) -> Result<()> {
        let instance = value.to_serde();
        if let Err(mut errors) = self.compiled.validate(&instance) {
            let detail = errors
                .next()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "value does not match schema".to_string());
            return Err(Error::Schema(detail));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object_schema() -> SchemaValidator {
        SchemaValidator::from_value(&serde_json::json!({
            "type": "object",
            "properties": { "x": { "type": "number" } }
        }))
        .unwrap()
    }

    #[test]
    fn test_accepts_matching_value() {
        let validator = object_schema();
        let value = JsonValue::from_slice(br#"{"x": 1}"#).unwrap();
        assert!(validator.validate(&value).is_ok());
    }

    #[test]
    fn test_rejects_mismatching_value() {
        let validator = object_schema();
        let value = JsonValue::from_slice(br#"{"x": "not a number"}"#).unwrap();
        let err = validator.validate(&value).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let result = SchemaValidator::from_value(&serde_json::json!({
            "type": "no-such-type"
        }));
        assert!(matches!(result, Err(Error::Schema(_))));
    }
}
