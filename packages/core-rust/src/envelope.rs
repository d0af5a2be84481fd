//! Message-transport envelope codec.
//!
//! Request: `{"id": string, "method": string, "params"?: any}`.
//! A payload is one envelope object or an array of them (a batch).
//! Success reply: `{"id", "result"}`; failure reply: `{"id", "error": {"code", "message"}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::ProcedureError;
use crate::middleware::Reply;

/// One inbound call.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Envelope {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnvelopeError {
    pub code: u16,
    pub message: String,
}

/// One outbound reply, keyed by the request id.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EnvelopeResponse {
    Success { id: String, result: Value },
    Failure { id: String, error: EnvelopeError },
}

impl EnvelopeResponse {
    #[must_use]
    pub fn success(id: impl Into<String>, reply: Reply) -> Self {
        Self::Success {
            id: id.into(),
            result: reply.into_value(),
        }
    }

    /// Failure reply. Internal errors carry only the generic message.
    #[must_use]
    pub fn failure(id: impl Into<String>, error: &ProcedureError) -> Self {
        Self::Failure {
            id: id.into(),
            error: EnvelopeError {
                code: error.status().as_u16(),
                message: error.public_message(),
            },
        }
    }

    #[must_use]
    pub fn not_found(id: impl Into<String>, method: &str) -> Self {
        Self::failure(id, &ProcedureError::not_found(format!("no operation `{method}`")))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Success { id, .. } | Self::Failure { id, .. } => id,
        }
    }

    /// Serialises the reply to its wire text.
    ///
    /// # Errors
    ///
    /// Returns an error only if the result value cannot be serialised.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Why a payload produced no envelopes at all.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is neither an envelope nor an array of envelopes")]
    Shape,
}

/// Decodes one transport message.
///
/// Batch elements that are not valid envelopes are skipped with a warning;
/// the rest of the batch is still returned.
///
/// # Errors
///
/// Returns `DecodeError` when the payload is not JSON or a single payload
/// is not an envelope.
pub fn decode(text: &str) -> Result<Vec<Envelope>, DecodeError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match serde_json::from_value::<Envelope>(item) {
                Ok(envelope) => Some(envelope),
                Err(error) => {
                    warn!(index, %error, "dropping malformed batch element");
                    None
                }
            })
            .collect()),
        single @ Value::Object(_) => serde_json::from_value::<Envelope>(single)
            .map(|envelope| vec![envelope])
            .map_err(|_| DecodeError::Shape),
        _ => Err(DecodeError::Shape),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ValidationFailure;

    #[test]
    fn decodes_single_envelope_with_default_params() {
        let envelopes = decode(r#"{"id":"1","method":"echo"}"#).unwrap();
        assert_eq!(
            envelopes,
            vec![Envelope {
                id: "1".to_owned(),
                method: "echo".to_owned(),
                params: Value::Null,
            }]
        );
    }

    #[test]
    fn batch_skips_invalid_elements() {
        let envelopes = decode(
            r#"[{"id":"a","method":"x","params":[1]},{"method":"no-id"},{"id":"b","method":"y"}]"#,
        )
        .unwrap();
        let ids: Vec<_> = envelopes.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(envelopes[0].params, json!([1]));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(decode("not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode("42"), Err(DecodeError::Shape)));
        assert!(matches!(decode(r#"{"id":"1"}"#), Err(DecodeError::Shape)));
    }

    #[test]
    fn replies_use_wire_shape() {
        let ok = EnvelopeResponse::success("7", Reply::Value(json!({"n": 1})));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": "7", "result": {"n": 1}})
        );

        let missing = EnvelopeResponse::not_found("8", "nope");
        assert_eq!(
            serde_json::to_value(&missing).unwrap(),
            json!({"id": "8", "error": {"code": 404, "message": "no operation `nope`"}})
        );

        let invalid = EnvelopeResponse::failure("9", &ValidationFailure::single("bad").into());
        assert!(matches!(invalid, EnvelopeResponse::Failure { ref error, .. } if error.code == 422));
        assert_eq!(invalid.id(), "9");
    }

    #[test]
    fn internal_failures_hide_cause() {
        let error = ProcedureError::Internal(anyhow::anyhow!("db password leaked"));
        let reply = EnvelopeResponse::failure("1", &error);
        let text = reply.to_text().unwrap();
        assert!(!text.contains("password"));
        assert!(text.contains("\"code\":500"));
    }
}
