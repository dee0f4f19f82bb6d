//! Provider adapters.
//!
//! Each provider is a variant of `ProviderKind`; the methods here dispatch to
//! the per-vendor module so the session never matches on the provider itself.
mod gemini;
mod openai;

use serde_json::Value;

use crate::config::ProviderConfig;
use crate::model::{GenerationRequest, ProviderKind};

/// Error envelope returned by a provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct VendorError {
    /// Vendor status or error code (`INVALID_ARGUMENT`, `model_not_found`).
    pub code: Option<String>,
    pub message: String,
}

/// Whether the upstream call streams incremental events or returns one body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Streaming,
    OneShot,
}

impl ProviderKind {
    pub(crate) fn endpoint(&self, config: &ProviderConfig, delivery: Delivery) -> String {
        match (self, delivery) {
            (Self::Gemini, Delivery::Streaming) => gemini::stream_url(config),
            (Self::Gemini, Delivery::OneShot) => gemini::one_shot_url(config),
            (Self::OpenAi, _) => openai::chat_url(config),
        }
    }

    pub(crate) fn build_body(
        &self,
        req: &GenerationRequest,
        config: &ProviderConfig,
        delivery: Delivery,
    ) -> Value {
        match self {
            Self::Gemini => gemini::build_body(req),
            Self::OpenAi => {
                openai::build_body(req, &config.model, delivery == Delivery::Streaming)
            }
        }
    }

    pub(crate) fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder {
        match self {
            Self::Gemini => builder.header("x-goog-api-key", api_key),
            Self::OpenAi => builder.bearer_auth(api_key),
        }
    }

    /// JSON pointer to the generated text inside one payload.
    pub(crate) fn text_pointer(&self, delivery: Delivery) -> &'static str {
        match (self, delivery) {
            (Self::Gemini, Delivery::Streaming) => gemini::DELTA_POINTER,
            (Self::Gemini, Delivery::OneShot) => gemini::ONE_SHOT_POINTER,
            (Self::OpenAi, Delivery::Streaming) => openai::DELTA_POINTER,
            (Self::OpenAi, Delivery::OneShot) => openai::ONE_SHOT_POINTER,
        }
    }

    /// Parses the provider's error envelope, or `None` when the body does
    /// not have this provider's error shape.
    pub(crate) fn vendor_error(&self, body: &Value) -> Option<VendorError> {
        match self {
            Self::Gemini => gemini::vendor_error(body),
            Self::OpenAi => openai::vendor_error(body),
        }
    }

    /// Case-insensitive substrings suggesting a 429 is quota, not throttling.
    pub(crate) fn quota_markers(&self) -> &'static [&'static str] {
        match self {
            Self::Gemini => gemini::QUOTA_MARKERS,
            Self::OpenAi => openai::QUOTA_MARKERS,
        }
    }
}
