use std::fmt;
use std::time::Duration;

use crate::errors::RelayError;
use crate::model::ProviderKind;

/// Connection settings for one upstream provider.
#[derive(Clone)]
pub struct ProviderConfig {
    /// API key; `None` makes every session for this provider fail with a
    /// configuration error.
    pub api_key: Option<String>,
    /// Base URL, overridable for proxies or local test servers.
    pub base_url: String,
    /// Model name sent upstream.
    pub model: String,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: None,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into()).filter(|k: &String| !k.trim().is_empty());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub(crate) fn trimmed_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

/// Process-wide relay configuration.
///
/// Built once at startup and shared read-only by every session.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub gemini: ProviderConfig,
    pub openai: ProviderConfig,
    /// TCP/TLS connect timeout for upstream requests.
    pub connect_timeout: Duration,
    /// Upper bound from sending the upstream request to the first body chunk.
    pub first_byte_timeout: Duration,
    /// Upper bound on total session lifetime.
    pub session_timeout: Duration,
    /// Bounded event buffer between the session task and the consumer.
    pub stream_buffer_capacity: usize,
    /// Largest partial line the frame decoder will buffer.
    pub max_line_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            gemini: ProviderConfig::new(
                "https://generativelanguage.googleapis.com",
                "gemini-2.0-flash",
            ),
            openai: ProviderConfig::new("https://api.openai.com", "gpt-4o-mini"),
            connect_timeout: Duration::from_secs(10),
            first_byte_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(300),
            stream_buffer_capacity: 64,
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl RelayConfig {
    /// Builds a config from the process environment.
    ///
    /// Recognized variables: `GEMINI_API_KEY`, `OPENAI_API_KEY`,
    /// `RELAY_GEMINI_BASE_URL`, `RELAY_OPENAI_BASE_URL`, `RELAY_GEMINI_MODEL`,
    /// `RELAY_OPENAI_MODEL`, `RELAY_FIRST_BYTE_TIMEOUT_SECS`,
    /// `RELAY_SESSION_TIMEOUT_SECS`, `RELAY_MAX_LINE_BYTES`.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RelayError> {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY") {
            config.gemini = config.gemini.api_key(key);
        }
        if let Some(key) = non_empty("OPENAI_API_KEY") {
            config.openai = config.openai.api_key(key);
        }
        if let Some(url) = non_empty("RELAY_GEMINI_BASE_URL") {
            config.gemini = config.gemini.base_url(url);
        }
        if let Some(url) = non_empty("RELAY_OPENAI_BASE_URL") {
            config.openai = config.openai.base_url(url);
        }
        if let Some(model) = non_empty("RELAY_GEMINI_MODEL") {
            config.gemini = config.gemini.model(model);
        }
        if let Some(model) = non_empty("RELAY_OPENAI_MODEL") {
            config.openai = config.openai.model(model);
        }
        if let Some(raw) = non_empty("RELAY_FIRST_BYTE_TIMEOUT_SECS") {
            config.first_byte_timeout =
                Duration::from_secs(parse_number("RELAY_FIRST_BYTE_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = non_empty("RELAY_SESSION_TIMEOUT_SECS") {
            config.session_timeout =
                Duration::from_secs(parse_number("RELAY_SESSION_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = non_empty("RELAY_MAX_LINE_BYTES") {
            config.max_line_bytes = parse_number("RELAY_MAX_LINE_BYTES", &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks numeric limits that would make every session fail.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.stream_buffer_capacity == 0 {
            return Err(RelayError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(RelayError::Config(
                "max_line_bytes must be greater than 0".into(),
            ));
        }
        if self.first_byte_timeout.is_zero() || self.session_timeout.is_zero() {
            return Err(RelayError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn provider(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::Gemini => &self.gemini,
            ProviderKind::OpenAi => &self.openai,
        }
    }

    /// Returns the credential for `kind`, or `None` when it is not configured.
    pub fn resolve_credential(&self, kind: ProviderKind) -> Option<&str> {
        self.provider(kind).api_key.as_deref()
    }

    pub fn first_byte_timeout(mut self, timeout: Duration) -> Self {
        self.first_byte_timeout = timeout;
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, RelayError> {
    raw.trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}
