//! Streaming chat relay: one client request in, one upstream provider stream
//! out, normalized into ordered text fragments and exactly one terminal event.
//!
//! # Usage
//!
//! ```no_run
//! use chat_relay_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), RelayError> {
//! let relay = Relay::new(RelayConfig::from_env()?)?;
//!
//! let mut stream = relay.start_stream(
//!     RelayRequest::new("openai", "Say hello")
//!         .system_instruction("Answer briefly.")
//!         .turn(Turn::user("Hi"))
//!         .turn(Turn::assistant("Hello!")),
//! );
//! while let Some(event) = stream.next_event().await {
//!     print!("{}", event.to_sse_frame());
//! }
//! # Ok(())
//! # }
//! ```

/// Token authentication seam.
pub mod auth;
/// Upstream error classification.
pub mod classify;
/// Process-wide relay configuration.
pub mod config;
/// Incremental line decoding of upstream bytes.
pub mod decoder;
/// Public error types.
pub mod errors;
/// Text extraction from decoded lines.
pub mod extract;
/// Request types and provider ids.
pub mod model;
/// Logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Relay entry point and builder.
pub mod relay;
/// Session state machine.
pub mod session;
/// Client-facing events and stream handle.
pub mod stream;
mod upstream;
mod vendors;

pub use auth::{AuthRejected, Authenticator, DigestAuthenticator, Identity, token_digest};
pub use classify::classify;
pub use config::{ProviderConfig, RelayConfig};
pub use decoder::{DecodedLine, FrameDecoder};
pub use errors::{DecodeError, ErrorCategory, RelayError, RelayFailure};
pub use extract::{Delta, Fragment, extract, extract_delta};
pub use model::{GenerationRequest, ProviderKind, RelayRequest, Role, Turn};
pub use relay::{Relay, RelayBuilder};
pub use session::SessionState;
pub use stream::{AbortHandle, RelayEvent, RelayStream, RelayTranscript};
