use std::pin::Pin;

use bytes::Bytes;
use futures::StreamExt as _;
use tracing::debug;

use crate::classify;
use crate::config::ProviderConfig;
use crate::errors::{ErrorCategory, RelayFailure};
use crate::extract::text_at;
use crate::model::{GenerationRequest, ProviderKind};
use crate::vendors::Delivery;

/// Upstream body as it arrives, with read errors already mapped.
pub(crate) type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<Bytes, RelayFailure>> + Send + 'static>>;

/// Sends the streaming request. Non-success statuses are classified here, so
/// a rejected request never reaches the decoder.
pub(crate) async fn open_stream(
    client: &reqwest::Client,
    config: &ProviderConfig,
    api_key: &str,
    req: &GenerationRequest,
) -> Result<ByteStream, RelayFailure> {
    let provider = req.provider();
    let response = send(client, config, api_key, req, Delivery::Streaming).await?;
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(classify::rejection(provider, status.as_u16(), &body));
    }
    debug!(%status, "upstream stream opened");

    let stream = response.bytes_stream().map(move |item| {
        item.map_err(|e| RelayFailure::transport(format!("{provider} stream read failed: {e}")))
    });
    Ok(Box::pin(stream))
}

/// Non-streaming request; returns the full generated text.
pub(crate) async fn complete(
    client: &reqwest::Client,
    config: &ProviderConfig,
    api_key: &str,
    req: &GenerationRequest,
) -> Result<String, RelayFailure> {
    let provider = req.provider();
    let response = send(client, config, api_key, req, Delivery::OneShot).await?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| RelayFailure::transport(format!("{provider} response read failed: {e}")))?;
    if !status.is_success() {
        return Err(classify::rejection(provider, status.as_u16(), &body));
    }

    let value: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
        RelayFailure::upstream(
            ErrorCategory::Malformed,
            format!("{provider} returned invalid JSON: {e}"),
        )
    })?;
    text_at(&value, provider.text_pointer(Delivery::OneShot)).ok_or_else(|| {
        RelayFailure::upstream(
            ErrorCategory::Malformed,
            format!("{provider} response did not include output text"),
        )
    })
}

async fn send(
    client: &reqwest::Client,
    config: &ProviderConfig,
    api_key: &str,
    req: &GenerationRequest,
    delivery: Delivery,
) -> Result<reqwest::Response, RelayFailure> {
    let provider: ProviderKind = req.provider();
    let body = provider.build_body(req, config, delivery);
    let url = provider.endpoint(config, delivery);
    debug!(%provider, model = %config.model, ?delivery, "sending upstream request");

    provider
        .authorize(client.post(url), api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| RelayFailure::transport(format!("{provider} request failed: {e}")))
}
