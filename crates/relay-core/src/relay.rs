use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::auth::{Authenticator, Identity};
use crate::config::RelayConfig;
use crate::errors::{RelayError, RelayFailure};
use crate::model::{GenerationRequest, RelayRequest};
use crate::session::{Downstream, RelaySession, SessionContext};
use crate::stream::{AbortHandle, RelayStream};
use crate::upstream;

/// Entry point for running relay sessions.
///
/// Cheap to clone; clones share the HTTP client and the read-only config.
#[derive(Clone)]
pub struct Relay {
    ctx: SessionContext,
}

impl Relay {
    /// Starts a builder.
    pub fn builder() -> RelayBuilder {
        RelayBuilder::default()
    }

    /// Builds a relay with a default HTTP client.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    /// Starts one streaming session on the current Tokio runtime.
    ///
    /// Never fails up front: invalid input, missing credentials and upstream
    /// rejections all arrive as the terminal `RelayEvent::Error`.
    pub fn start_stream(&self, request: RelayRequest) -> RelayStream {
        let config = &self.ctx.config;
        let session_id = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::channel(config.stream_buffer_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = watch::channel(false);

        let session = RelaySession::new(session_id, config.max_line_bytes);
        debug!(%session_id, provider = %request.provider, "spawning relay session");
        tokio::spawn(session.run(
            self.ctx.clone(),
            request,
            Downstream::new(tx, abort_rx),
            final_tx,
        ));

        RelayStream {
            session_id,
            rx,
            final_rx,
            abort_handle: AbortHandle { tx: abort_tx },
            saw_terminal: false,
        }
    }

    /// Authenticates `token` and, if accepted, starts a session.
    pub async fn start_authenticated<A>(
        &self,
        authenticator: &A,
        token: &str,
        request: RelayRequest,
    ) -> Result<(Identity, RelayStream), RelayError>
    where
        A: Authenticator + ?Sized,
    {
        let identity = authenticator
            .authenticate(token)
            .await
            .map_err(|e| RelayError::Unauthorized(e.to_string()))?;
        debug!(subject = %identity.subject, "token accepted");
        Ok((identity, self.start_stream(request)))
    }

    /// Streams to completion and returns the concatenated text.
    pub async fn collect_text(&self, request: RelayRequest) -> Result<String, RelayError> {
        Ok(self.start_stream(request).finish().await?.text)
    }

    /// Non-streaming request through the same adapters and classifier.
    pub async fn complete(&self, request: RelayRequest) -> Result<String, RelayError> {
        let request = GenerationRequest::try_from(request)?;
        let provider = request.provider();
        let api_key = self.ctx.config.resolve_credential(provider).ok_or_else(|| {
            RelayFailure::configuration(format!("no credential configured for {provider}"))
        })?;
        let deadline = self.ctx.config.session_timeout;
        let completion = upstream::complete(
            &self.ctx.client,
            self.ctx.config.provider(provider),
            api_key,
            &request,
        );
        match tokio::time::timeout(deadline, completion).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RelayFailure::upstream(
                crate::errors::ErrorCategory::Unavailable,
                "session exceeded its maximum duration",
            )
            .into()),
        }
    }
}

/// Builder for `Relay`.
#[derive(Default)]
pub struct RelayBuilder {
    config: Option<RelayConfig>,
    client: Option<reqwest::Client>,
}

impl RelayBuilder {
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses a caller-provided HTTP client instead of building one.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Validates the config and builds the relay.
    pub fn build(self) -> Result<Relay, RelayError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let client = match self.client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(config.connect_timeout)
                .build()
                .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))?,
        };
        Ok(Relay {
            ctx: SessionContext {
                client,
                config: Arc::new(config),
            },
        })
    }
}
