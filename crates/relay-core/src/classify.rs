//! Maps rejected upstream responses to a stable `ErrorCategory`.
//!
//! Runs on the initial status and body only, before any stream decoding.

use serde_json::Value;
use tracing::debug;

use crate::errors::{ErrorCategory, RelayFailure};
use crate::model::ProviderKind;
use crate::vendors::VendorError;

/// Longest body excerpt carried in failure messages.
const BODY_SAMPLE_CHARS: usize = 200;

/// Classifies a non-success upstream response. Pure: the same inputs always
/// give the same category.
pub fn classify(provider: ProviderKind, status: u16, body: &str) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::AuthFailure,
        429 => {
            // Best-effort wording match; a miss just leaves it as RateLimited.
            let lower = body.to_ascii_lowercase();
            if provider
                .quota_markers()
                .iter()
                .any(|marker| lower.contains(marker))
            {
                ErrorCategory::QuotaExhausted
            } else {
                ErrorCategory::RateLimited
            }
        }
        s if s >= 500 => ErrorCategory::Unavailable,
        _ => match vendor_error(provider, body) {
            Some(_) => ErrorCategory::Unknown,
            None => ErrorCategory::Malformed,
        },
    }
}

/// Classifies and builds the terminal failure.
///
/// A body in the vendor's error shape contributes its message verbatim;
/// status and vendor code go to the log. Any other body is summarized with
/// the status attached.
pub fn rejection(provider: ProviderKind, status: u16, body: &str) -> RelayFailure {
    let category = classify(provider, status, body);
    match vendor_error(provider, body) {
        Some(VendorError { code, message }) => {
            debug!(%provider, status, code = code.as_deref(), %category, "upstream rejected request");
            RelayFailure::upstream(category, message)
        }
        None => RelayFailure::upstream(
            category,
            format!(
                "{provider} responded with status {status}: {}",
                body_sample(body)
            ),
        ),
    }
}

fn vendor_error(provider: ProviderKind, body: &str) -> Option<VendorError> {
    let value: Value = serde_json::from_str(body).ok()?;
    provider.vendor_error(&value)
}

fn body_sample(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    trimmed.chars().take(BODY_SAMPLE_CHARS).collect()
}
