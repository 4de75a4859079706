//! Column-level encryption of outgoing rows.

use crate::cipher::{decrypt_string, encrypt_string};
use crate::error::{CryptoError, CryptoResult};
use crate::key::DerivedKey;
use rowsync_types::{is_truthy, Row};
use serde_json::Value;

/// Replaces each listed column that is present and truthy with its
/// ciphertext. Missing or falsy columns are left alone.
///
/// Strings are encrypted as-is; numbers and booleans by their JSON text;
/// arrays and objects by their serialized JSON.
pub fn encrypt_fields(mut row: Row, fields: &[String], key: &DerivedKey) -> CryptoResult<Row> {
    for field in fields {
        let Some(value) = row.get(field) else {
            continue;
        };
        if !is_truthy(value) {
            continue;
        }

        let plaintext = match value {
            Value::String(s) => s.clone(),
            Value::Number(_) | Value::Bool(_) => value.to_string(),
            Value::Array(_) | Value::Object(_) => serde_json::to_string(value)?,
            Value::Null => {
                return Err(CryptoError::UnsupportedField {
                    field: field.clone(),
                    reason: "null value".to_string(),
                });
            }
        };

        let ciphertext = encrypt_string(key, &plaintext)?;
        row.insert(field.clone(), Value::String(ciphertext));
    }
    Ok(row)
}

/// Reverses [`encrypt_fields`] for the listed columns, yielding the text
/// form of each original value. Empty strings were never encrypted and are
/// left alone.
pub fn decrypt_fields(mut row: Row, fields: &[String], key: &DerivedKey) -> CryptoResult<Row> {
    for field in fields {
        if let Some(Value::String(ciphertext)) = row.get(field) {
            if ciphertext.is_empty() {
                continue;
            }
            let plaintext = decrypt_string(key, ciphertext)?;
            row.insert(field.clone(), Value::String(plaintext));
        }
    }
    Ok(row)
}
