use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};

use crate::errors::{RelayError, RelayFailure};
use crate::model::ProviderKind;

/// Normalized events sent to the client, in order.
///
/// A session emits zero or more `Fragment`s followed by exactly one `Done` or
/// `Error`, unless the client went away first.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayEvent {
    /// Generated text, in upstream decode order.
    Fragment { seq: u64, text: String },
    /// Terminal success marker.
    Done,
    /// Terminal failure.
    Error(RelayFailure),
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }

    /// Renders the event as one server-sent-events frame.
    pub fn to_sse_frame(&self) -> String {
        let data = match self {
            Self::Fragment { text, .. } => json!({ "fragment": text }).to_string(),
            Self::Done => crate::extract::DONE_SENTINEL.to_string(),
            Self::Error(failure) => json!({
                "error": {
                    "category": failure.category(),
                    "message": failure.message(),
                }
            })
            .to_string(),
        };
        format!("data: {data}\n\n")
    }
}

/// Text delivered by a completed session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayTranscript {
    pub session_id: uuid::Uuid,
    pub provider: ProviderKind,
    pub text: String,
    pub fragments: u64,
}

/// Handle used to stop a running session.
#[derive(Clone)]
pub struct AbortHandle {
    pub(crate) tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation. The session closes its upstream connection and
    /// ends without a terminal event.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Consumer side of one relay session.
pub struct RelayStream {
    pub(crate) session_id: uuid::Uuid,
    pub(crate) rx: mpsc::Receiver<RelayEvent>,
    pub(crate) final_rx: oneshot::Receiver<Result<RelayTranscript, RelayError>>,
    pub(crate) abort_handle: AbortHandle,
    pub(crate) saw_terminal: bool,
}

impl RelayStream {
    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for the next event. Returns `None` once the session has ended.
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        let event = self.rx.recv().await;
        if event.as_ref().is_some_and(RelayEvent::is_terminal) {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events and returns the session result.
    pub async fn finish(mut self) -> Result<RelayTranscript, RelayError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }

        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Protocol(format!(
                "relay session {} ended without a result",
                self.session_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;

    #[test]
    fn sse_frames_match_client_protocol() {
        let fragment = RelayEvent::Fragment {
            seq: 0,
            text: "say \"hi\"\n".into(),
        };
        assert_eq!(
            fragment.to_sse_frame(),
            "data: {\"fragment\":\"say \\\"hi\\\"\\n\"}\n\n"
        );
        assert_eq!(RelayEvent::Done.to_sse_frame(), "data: [DONE]\n\n");

        let error = RelayEvent::Error(RelayFailure::upstream(
            ErrorCategory::RateLimited,
            "slow down",
        ));
        let frame = error.to_sse_frame();
        let payload: serde_json::Value = serde_json::from_str(
            frame
                .strip_prefix("data: ")
                .and_then(|s| s.strip_suffix("\n\n"))
                .expect("frame shape"),
        )
        .expect("json");
        assert_eq!(payload["error"]["category"], "rate_limited");
        assert_eq!(payload["error"]["message"], "slow down");
    }

    #[test]
    fn only_done_and_error_are_terminal() {
        assert!(RelayEvent::Done.is_terminal());
        assert!(RelayEvent::Error(RelayFailure::transport("x")).is_terminal());
        assert!(
            !RelayEvent::Fragment {
                seq: 1,
                text: "a".into()
            }
            .is_terminal()
        );
    }
}
