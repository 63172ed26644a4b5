//! Payload codec: optional decryption of message payloads.

use std::sync::Arc;

use serde_json::Value;

use crate::types::{BoxError, Error};

/// Field of a structured payload that carries the encrypted body when the
/// publisher mixed plain and encrypted content.
pub const PN_OTHER: &str = "pn_other";

/// Decrypts message payloads. The algorithm is up to the implementation.
pub trait Cipher: Send + Sync {
    /// Decrypt a ciphertext string into its plaintext (expected to be JSON).
    fn decrypt(&self, ciphertext: &str) -> Result<String, BoxError>;
}

/// Applies the configured [`Cipher`] to message payloads.
#[derive(Clone, Default)]
pub(crate) struct PayloadCodec {
    cipher: Option<Arc<dyn Cipher>>,
    disable_pn_other_processing: bool,
}

impl PayloadCodec {
    pub(crate) fn new(cipher: Option<Arc<dyn Cipher>>, disable_pn_other_processing: bool) -> Self {
        Self {
            cipher,
            disable_pn_other_processing,
        }
    }

    /// Decode a payload. On failure the error is returned alongside the best
    /// value available, so the message can still be delivered.
    pub(crate) fn decode(&self, payload: Value) -> (Value, Option<Error>) {
        let Some(cipher) = self.cipher.as_deref() else {
            return (payload, None);
        };
        match payload {
            Value::String(ciphertext) => match decrypt_json(cipher, &ciphertext) {
                Ok(value) => (value, None),
                Err((fallback, e)) => (fallback.unwrap_or(Value::String(ciphertext)), Some(e)),
            },
            Value::Object(mut map) if !self.disable_pn_other_processing => {
                let Some(Value::String(ciphertext)) = map.get(PN_OTHER) else {
                    return (Value::Object(map), None);
                };
                match decrypt_json(cipher, ciphertext) {
                    Ok(value) => {
                        map.insert(PN_OTHER.to_string(), value);
                        (Value::Object(map), None)
                    }
                    Err((_, e)) => (Value::Object(map), Some(e)),
                }
            }
            other => (other, None),
        }
    }
}

/// Decrypt then JSON-decode. When decryption succeeds but the plaintext is
/// not JSON, the plaintext is returned as the fallback value.
fn decrypt_json(cipher: &dyn Cipher, ciphertext: &str) -> Result<Value, (Option<Value>, Error)> {
    let plaintext = cipher
        .decrypt(ciphertext)
        .map_err(|e| (None, Error::Cipher(e)))?;
    match serde_json::from_str(&plaintext) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::warn!("decrypted payload is not JSON: {e}");
            Err((Some(Value::String(plaintext)), Error::Json(e)))
        }
    }
}
