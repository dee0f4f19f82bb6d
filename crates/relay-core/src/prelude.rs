//! Common imports for typical relay usage.
pub use crate::{
    AbortHandle, ProviderKind, Relay, RelayConfig, RelayError, RelayEvent, RelayFailure,
    RelayRequest, RelayStream, RelayTranscript, Role, Turn,
};
