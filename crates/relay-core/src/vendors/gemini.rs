use serde_json::{Value, json};

use super::VendorError;
use crate::config::ProviderConfig;
use crate::model::{GenerationRequest, Role};

/// Acknowledgement placed after the synthetic system turn so the real history
/// starts on a user turn.
pub(crate) const SYSTEM_ACK: &str = "Understood.";

pub(crate) const DELTA_POINTER: &str = "/candidates/0/content/parts/0/text";
pub(crate) const ONE_SHOT_POINTER: &str = DELTA_POINTER;
pub(crate) const QUOTA_MARKERS: &[&str] = &["quota"];

pub(crate) fn stream_url(config: &ProviderConfig) -> String {
    format!(
        "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
        config.trimmed_base_url(),
        config.model
    )
}

pub(crate) fn one_shot_url(config: &ProviderConfig) -> String {
    format!(
        "{}/v1beta/models/{}:generateContent",
        config.trimmed_base_url(),
        config.model
    )
}

pub(crate) fn build_body(req: &GenerationRequest) -> Value {
    let mut contents = Vec::with_capacity(req.prior_turns().len() + 3);
    if let Some(system) = req.system_instruction() {
        contents.push(content("user", system));
        contents.push(content("model", SYSTEM_ACK));
    }
    for turn in req.prior_turns() {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        contents.push(content(role, &turn.text));
    }
    contents.push(content("user", req.user_text()));
    json!({ "contents": contents })
}

fn content(role: &str, text: &str) -> Value {
    json!({ "role": role, "parts": [{ "text": text }] })
}

/// Gemini errors are `{"error": {...}}`, or a one-element array of that on
/// streaming endpoints.
pub(crate) fn vendor_error(body: &Value) -> Option<VendorError> {
    let envelope = match body {
        Value::Array(items) => items.first()?,
        other => other,
    };
    let error = envelope.get("error")?;
    Some(VendorError {
        code: error.get("status").and_then(Value::as_str).map(str::to_string),
        message: error.get("message")?.as_str()?.to_string(),
    })
}
