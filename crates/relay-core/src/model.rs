use std::fmt;
use std::str::FromStr;

use crate::errors::RelayFailure;

/// Upstream text-generation provider selected for a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Gemini `streamGenerateContent` (token-array style payloads).
    Gemini,
    /// OpenAI-compatible chat completions (delta-chat style payloads).
    OpenAi,
}

impl ProviderKind {
    /// Returns the stable wire id (`gemini` or `openai`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = RelayFailure;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            other => Err(RelayFailure::client_input(format!(
                "unknown provider id: {other:?}"
            ))),
        }
    }
}

/// Speaker of a prior conversation turn.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One prior turn of the conversation.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Raw inbound request as handed over by the routing layer.
///
/// Nothing is validated yet; `GenerationRequest::try_from` does that when the
/// session leaves `Idle`.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RelayRequest {
    /// Provider id (`gemini` or `openai`).
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub history: Vec<Turn>,
    /// New user message.
    pub message: String,
}

impl RelayRequest {
    /// Creates a request with no system instruction and no history.
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Sets the system instruction.
    pub fn system_instruction(mut self, text: impl Into<String>) -> Self {
        self.system_instruction = Some(text.into());
        self
    }

    /// Appends a prior turn.
    pub fn turn(mut self, turn: Turn) -> Self {
        self.history.push(turn);
        self
    }
}

/// Validated, immutable generation request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GenerationRequest {
    provider: ProviderKind,
    system_instruction: Option<String>,
    prior_turns: Vec<Turn>,
    user_text: String,
}

impl GenerationRequest {
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    /// System instruction, if one was given and is not blank.
    pub fn system_instruction(&self) -> Option<&str> {
        self.system_instruction.as_deref()
    }

    pub fn prior_turns(&self) -> &[Turn] {
        &self.prior_turns
    }

    pub fn user_text(&self) -> &str {
        &self.user_text
    }
}

impl TryFrom<RelayRequest> for GenerationRequest {
    type Error = RelayFailure;

    fn try_from(raw: RelayRequest) -> Result<Self, Self::Error> {
        let provider = raw.provider.parse::<ProviderKind>()?;
        if raw.message.trim().is_empty() {
            return Err(RelayFailure::client_input("message must not be empty"));
        }
        Ok(Self {
            provider,
            system_instruction: raw.system_instruction.filter(|s| !s.trim().is_empty()),
            prior_turns: raw.history,
            user_text: raw.message,
        })
    }
}
