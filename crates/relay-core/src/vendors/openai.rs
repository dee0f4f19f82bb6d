use serde_json::{Value, json};

use super::VendorError;
use crate::config::ProviderConfig;
use crate::model::{GenerationRequest, Role};

pub(crate) const DELTA_POINTER: &str = "/choices/0/delta/content";
pub(crate) const ONE_SHOT_POINTER: &str = "/choices/0/message/content";
pub(crate) const QUOTA_MARKERS: &[&str] = &["insufficient_quota", "quota"];

pub(crate) fn chat_url(config: &ProviderConfig) -> String {
    format!("{}/v1/chat/completions", config.trimmed_base_url())
}

pub(crate) fn build_body(req: &GenerationRequest, model: &str, stream: bool) -> Value {
    let mut messages = Vec::with_capacity(req.prior_turns().len() + 2);
    if let Some(system) = req.system_instruction() {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for turn in req.prior_turns() {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        messages.push(json!({ "role": role, "content": turn.text }));
    }
    messages.push(json!({ "role": "user", "content": req.user_text() }));
    json!({
        "model": model,
        "messages": messages,
        "stream": stream,
    })
}

pub(crate) fn vendor_error(body: &Value) -> Option<VendorError> {
    let error = body.get("error")?;
    let code = error
        .get("code")
        .and_then(Value::as_str)
        .or_else(|| error.get("type").and_then(Value::as_str));
    Some(VendorError {
        code: code.map(str::to_string),
        message: error.get("message")?.as_str()?.to_string(),
    })
}
