use serde_json::Value;

use crate::decoder::DecodedLine;
use crate::model::ProviderKind;
use crate::vendors::Delivery;

/// Payload meaning "stream end"; consumed as a no-op.
pub const DONE_SENTINEL: &str = "[DONE]";

/// A unit of generated text ready to forward downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
}

/// Result of interpreting one decoded line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// Non-empty generated text.
    Text(Fragment),
    /// The `[DONE]` sentinel.
    EndMarker,
    /// Valid payload without text (role-only deltas, usage, safety metadata).
    Metadata,
    /// Payload was not JSON. Recovered by skipping the line.
    Anomaly(String),
}

/// Interprets one decoded line with the active provider's payload schema.
pub fn extract_delta(line: &DecodedLine, provider: ProviderKind) -> Delta {
    let payload = line.payload().trim();
    if payload == DONE_SENTINEL {
        return Delta::EndMarker;
    }
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => return Delta::Anomaly(e.to_string()),
    };
    match text_at(&value, provider.text_pointer(Delivery::Streaming)) {
        Some(text) => Delta::Text(Fragment { text }),
        None => Delta::Metadata,
    }
}

/// Returns the fragment carried by `line`, if any.
pub fn extract(line: &DecodedLine, provider: ProviderKind) -> Option<Fragment> {
    match extract_delta(line, provider) {
        Delta::Text(fragment) => Some(fragment),
        _ => None,
    }
}

pub(crate) fn text_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}
