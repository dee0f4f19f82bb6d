//! One relay session: validate, open upstream, decode, forward, terminate.
//!
//! The session task owns the upstream body, the decoder buffer and the
//! downstream sender. Returning from `run` drops all three, which closes both
//! connections on every exit path.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::config::RelayConfig;
use crate::decoder::FrameDecoder;
use crate::errors::{ErrorCategory, RelayError, RelayFailure};
use crate::extract::{Delta, Fragment, extract_delta};
use crate::model::{GenerationRequest, ProviderKind, RelayRequest};
use crate::stream::{RelayEvent, RelayTranscript};
use crate::upstream;

/// How long the terminal event may wait for buffer space before it is
/// dropped. Never extends past the session deadline.
const TERMINAL_SEND_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a relay session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Streaming,
    Closing,
    Completed,
    Failed,
    /// Client went away; no terminal event is sent.
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub(crate) fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Opening) | (Opening, Streaming) | (Streaming, Closing) => true,
            (Closing, Completed) => true,
            (Idle | Opening | Streaming, Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// How the session loop ended, before the terminal event is sent.
#[derive(Debug, PartialEq)]
pub(crate) enum Exit {
    Completed,
    Failed(RelayFailure),
    Cancelled,
}

/// Shared, read-only inputs for a session.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub client: reqwest::Client,
    pub config: Arc<RelayConfig>,
}

/// Downstream side: ordered forwarding plus cancellation detection.
pub(crate) struct Downstream {
    tx: mpsc::Sender<RelayEvent>,
    abort_rx: watch::Receiver<bool>,
    seq: u64,
    text: String,
}

impl Downstream {
    pub(crate) fn new(tx: mpsc::Sender<RelayEvent>, abort_rx: watch::Receiver<bool>) -> Self {
        Self {
            tx,
            abort_rx,
            seq: 0,
            text: String::new(),
        }
    }

    /// Sends one fragment. Returns `false` when the client is gone or the
    /// session was aborted.
    async fn forward(&mut self, fragment: Fragment) -> bool {
        let event = RelayEvent::Fragment {
            seq: self.seq,
            text: fragment.text.clone(),
        };
        let sent = tokio::select! {
            biased;
            _ = aborted(&mut self.abort_rx) => false,
            sent = self.tx.send(event) => sent.is_ok(),
        };
        if sent {
            self.seq = self.seq.saturating_add(1);
            self.text.push_str(&fragment.text);
        }
        sent
    }

    /// Resolves when the client disconnects or an abort is requested.
    async fn cancelled(&mut self) {
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = aborted(&mut self.abort_rx) => {}
        }
    }

    /// Sends the terminal event. Once `deadline` has passed it is only
    /// delivered if buffer space is free right away.
    async fn send_terminal(&self, event: RelayEvent, deadline: Instant) -> bool {
        let give_up = (Instant::now() + TERMINAL_SEND_GRACE).min(deadline);
        matches!(
            time::timeout_at(give_up, self.tx.send(event)).await,
            Ok(Ok(()))
        )
    }
}

async fn aborted(rx: &mut watch::Receiver<bool>) {
    let signalled = rx.wait_for(|flag| *flag).await.is_ok();
    if !signalled {
        // Every abort handle is gone, so abort can no longer happen.
        std::future::pending::<()>().await;
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadlines {
    first_byte: Instant,
    session: Instant,
}

impl Deadlines {
    pub(crate) fn from_config(config: &RelayConfig) -> Self {
        let now = Instant::now();
        let session = now + config.session_timeout;
        Self {
            first_byte: (now + config.first_byte_timeout).min(session),
            session,
        }
    }

    fn expired(&self, waiting_for_first_byte: bool) -> RelayFailure {
        let message = if waiting_for_first_byte && self.first_byte < self.session {
            "no data from upstream before the first-byte deadline"
        } else {
            "session exceeded its maximum duration"
        };
        RelayFailure::upstream(ErrorCategory::Unavailable, message)
    }
}

pub(crate) struct RelaySession {
    id: uuid::Uuid,
    state: SessionState,
    decoder: FrameDecoder,
    skipped_lines: u64,
}

impl RelaySession {
    pub(crate) fn new(id: uuid::Uuid, max_line_bytes: usize) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            decoder: FrameDecoder::new(max_line_bytes),
            skipped_lines: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {:?} -> {next:?}",
            self.state
        );
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Runs the session to its end and reports the result on `final_tx`.
    pub(crate) async fn run(
        mut self,
        ctx: SessionContext,
        request: RelayRequest,
        mut downstream: Downstream,
        final_tx: oneshot::Sender<Result<RelayTranscript, RelayError>>,
    ) {
        let span = info_span!(
            "relay_session",
            session_id = %self.id,
            provider = %request.provider,
        );
        async move {
            let deadlines = Deadlines::from_config(&ctx.config);
            let (exit, provider) = self.drive(&ctx, request, deadlines, &mut downstream).await;
            let result = self.terminate(exit, provider, deadlines, &downstream).await;
            let _ = final_tx.send(result);
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &mut self,
        ctx: &SessionContext,
        raw: RelayRequest,
        deadlines: Deadlines,
        downstream: &mut Downstream,
    ) -> (Exit, Option<ProviderKind>) {
        let request = match GenerationRequest::try_from(raw) {
            Ok(request) => request,
            Err(failure) => return (Exit::Failed(failure), None),
        };
        let provider = request.provider();
        let Some(api_key) = ctx.config.resolve_credential(provider) else {
            let failure =
                RelayFailure::configuration(format!("no credential configured for {provider}"));
            return (Exit::Failed(failure), Some(provider));
        };

        self.transition(SessionState::Opening);
        let opened = tokio::select! {
            biased;
            _ = downstream.cancelled() => return (Exit::Cancelled, Some(provider)),
            opened = time::timeout_at(
                deadlines.first_byte,
                upstream::open_stream(&ctx.client, ctx.config.provider(provider), api_key, &request),
            ) => opened,
        };
        let body = match opened {
            Ok(Ok(body)) => body,
            Ok(Err(failure)) => return (Exit::Failed(failure), Some(provider)),
            Err(_) => return (Exit::Failed(deadlines.expired(true)), Some(provider)),
        };

        self.transition(SessionState::Streaming);
        let exit = self.pump(body, provider, deadlines, downstream).await;
        (exit, Some(provider))
    }

    /// Streaming loop: read, decode, extract, forward one fragment at a time.
    pub(crate) async fn pump<S>(
        &mut self,
        mut body: S,
        provider: ProviderKind,
        deadlines: Deadlines,
        downstream: &mut Downstream,
    ) -> Exit
    where
        S: futures::Stream<Item = Result<Bytes, RelayFailure>> + Unpin,
    {
        let mut waiting_for_first_byte = true;
        loop {
            let deadline = if waiting_for_first_byte {
                deadlines.first_byte
            } else {
                deadlines.session
            };
            let next = tokio::select! {
                biased;
                _ = downstream.cancelled() => return Exit::Cancelled,
                next = time::timeout_at(deadline, body.next()) => next,
            };

            let chunk = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(failure))) => return Exit::Failed(failure),
                Ok(None) => break,
                Err(_) => return Exit::Failed(deadlines.expired(waiting_for_first_byte)),
            };
            waiting_for_first_byte = false;

            let lines = match self.decoder.feed(&chunk) {
                Ok(lines) => lines,
                Err(e) => return Exit::Failed(e.into()),
            };
            for line in lines {
                match extract_delta(&line, provider) {
                    Delta::Text(fragment) => {
                        let forwarded = tokio::select! {
                            forwarded = downstream.forward(fragment) => forwarded,
                            _ = time::sleep_until(deadlines.session) => {
                                return Exit::Failed(deadlines.expired(false));
                            }
                        };
                        if !forwarded {
                            return Exit::Cancelled;
                        }
                    }
                    Delta::Anomaly(reason) => {
                        self.skipped_lines += 1;
                        debug!(%reason, "skipping malformed upstream line");
                    }
                    Delta::EndMarker => debug!("upstream end marker"),
                    Delta::Metadata => {}
                }
            }
        }

        self.transition(SessionState::Closing);
        let dropped = self.decoder.flush();
        if dropped > 0 {
            debug!(dropped, "discarded unterminated trailing line");
        }
        Exit::Completed
    }

    async fn terminate(
        &mut self,
        exit: Exit,
        provider: Option<ProviderKind>,
        deadlines: Deadlines,
        downstream: &Downstream,
    ) -> Result<RelayTranscript, RelayError> {
        match exit {
            Exit::Completed => {
                self.transition(SessionState::Completed);
                info!(
                    fragments = downstream.seq,
                    skipped_lines = self.skipped_lines,
                    "relay session completed"
                );
                if !downstream
                    .send_terminal(RelayEvent::Done, deadlines.session)
                    .await
                {
                    warn!("client did not accept completion marker");
                }
                let provider = provider.ok_or_else(|| {
                    RelayError::Protocol("completed session without a provider".into())
                })?;
                Ok(RelayTranscript {
                    session_id: self.id,
                    provider,
                    text: downstream.text.clone(),
                    fragments: downstream.seq,
                })
            }
            Exit::Failed(failure) => {
                self.transition(SessionState::Failed);
                warn!(
                    category = failure.category(),
                    fragments = downstream.seq,
                    error = %failure,
                    "relay session failed"
                );
                if !downstream
                    .send_terminal(RelayEvent::Error(failure.clone()), deadlines.session)
                    .await
                {
                    warn!("client did not accept error event");
                }
                Err(RelayError::Failed(failure))
            }
            Exit::Cancelled => {
                self.transition(SessionState::Cancelled);
                info!(fragments = downstream.seq, "client went away; upstream closed");
                Err(RelayError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};

    fn chunks(parts: &[&str]) -> Vec<Result<Bytes, RelayFailure>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect()
    }

    fn openai_line(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
    }

    fn streaming_session() -> RelaySession {
        let mut session = RelaySession::new(uuid::Uuid::new_v4(), 1024);
        session.transition(SessionState::Opening);
        session.transition(SessionState::Streaming);
        session
    }

    fn deadlines() -> Deadlines {
        Deadlines::from_config(&RelayConfig::default())
    }

    struct Wiring {
        downstream: Downstream,
        rx: mpsc::Receiver<RelayEvent>,
        abort_tx: watch::Sender<bool>,
    }

    fn downstream(capacity: usize) -> Wiring {
        let (tx, rx) = mpsc::channel(capacity);
        let (abort_tx, abort_rx) = watch::channel(false);
        Wiring {
            downstream: Downstream::new(tx, abort_rx),
            rx,
            abort_tx,
        }
    }

    fn drain_fragments(rx: &mut mpsc::Receiver<RelayEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RelayEvent::Fragment { text, .. } = event {
                out.push(text);
            }
        }
        out
    }

    /// Upstream body that records when it is dropped.
    struct DropFlag<S> {
        inner: S,
        dropped: Arc<AtomicBool>,
    }

    impl<S: futures::Stream + Unpin> futures::Stream for DropFlag<S> {
        type Item = S::Item;

        fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
            std::pin::Pin::new(&mut self.inner).poll_next(cx)
        }
    }

    impl<S> Drop for DropFlag<S> {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Opening));
        assert!(Idle.can_transition_to(Failed));
        assert!(Streaming.can_transition_to(Cancelled));
        assert!(Closing.can_transition_to(Completed));
        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Closing.can_transition_to(Failed));
        assert!(Completed.is_terminal() && Cancelled.is_terminal());
    }

    #[tokio::test]
    async fn fragments_are_forwarded_in_decode_order() {
        let body = [openai_line("a"), openai_line("b"), openai_line("c")].concat();
        // Split at awkward offsets, including inside the JSON payloads.
        let (p1, rest) = body.split_at(17);
        let (p2, p3) = rest.split_at(60);
        let mut h = downstream(16);
        let mut session = streaming_session();

        let exit = session
            .pump(
                stream::iter(chunks(&[p1, p2, p3, "data: [DONE]\n\n"])),
                ProviderKind::OpenAi,
                deadlines(),
                &mut h.downstream,
            )
            .await;

        assert_eq!(exit, Exit::Completed);
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(drain_fragments(&mut h.rx), vec!["a", "b", "c"]);
        assert_eq!(h.downstream.text, "abc");
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_without_ending_the_session() {
        let body = [
            openai_line("x"),
            "data: {not json\n\n".to_string(),
            "data: upstream-diagnostic\n".to_string(),
            openai_line("y"),
        ]
        .concat();
        let mut h = downstream(16);
        let mut session = streaming_session();

        let exit = session
            .pump(
                stream::iter(chunks(&[&body])),
                ProviderKind::OpenAi,
                deadlines(),
                &mut h.downstream,
            )
            .await;

        assert_eq!(exit, Exit::Completed);
        assert_eq!(session.skipped_lines, 2);
        assert_eq!(drain_fragments(&mut h.rx), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn read_error_after_fragments_fails_with_transport() {
        let mut items = chunks(&[&openai_line("kept")]);
        items.push(Err(RelayFailure::transport("connection reset")));
        let mut h = downstream(16);
        let mut session = streaming_session();

        let exit = session
            .pump(stream::iter(items), ProviderKind::OpenAi, deadlines(), &mut h.downstream)
            .await;

        assert_eq!(exit, Exit::Failed(RelayFailure::transport("connection reset")));
        assert_eq!(drain_fragments(&mut h.rx), vec!["kept"]);
    }

    #[tokio::test]
    async fn oversized_partial_line_fails_the_session() {
        let mut h = downstream(4);
        let mut session = RelaySession::new(uuid::Uuid::new_v4(), 8);
        session.transition(SessionState::Opening);
        session.transition(SessionState::Streaming);

        let exit = session
            .pump(
                stream::iter(chunks(&["data: 0123456789abcdef"])),
                ProviderKind::Gemini,
                deadlines(),
                &mut h.downstream,
            )
            .await;

        assert!(matches!(exit, Exit::Failed(RelayFailure::Transport { .. })));
    }

    #[tokio::test]
    async fn client_disconnect_closes_upstream_without_terminal() {
        let dropped = Arc::new(AtomicBool::new(false));
        let body = DropFlag {
            inner: stream::iter(chunks(&[&openai_line("first")])).chain(stream::pending()),
            dropped: dropped.clone(),
        };
        let Wiring {
            mut downstream,
            mut rx,
            abort_tx: _abort_tx,
        } = downstream(16);
        let mut session = streaming_session();

        let consumer = tokio::spawn(async move {
            let first = rx.recv().await;
            drop(rx);
            first
        });
        let exit = session
            .pump(body, ProviderKind::OpenAi, deadlines(), &mut downstream)
            .await;
        assert_eq!(exit, Exit::Cancelled);
        assert!(dropped.load(Ordering::SeqCst), "upstream must be dropped");

        let first = consumer.await.expect("consumer task");
        assert_eq!(
            first,
            Some(RelayEvent::Fragment {
                seq: 0,
                text: "first".into()
            })
        );

        let result = session
            .terminate(exit, Some(ProviderKind::OpenAi), deadlines(), &downstream)
            .await;
        assert_eq!(result, Err(RelayError::Cancelled));
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn abort_signal_cancels_a_stalled_stream() {
        let mut h = downstream(4);
        let mut session = streaming_session();
        h.abort_tx.send(true).expect("abort");

        let exit = session
            .pump(
                stream::pending::<Result<Bytes, RelayFailure>>(),
                ProviderKind::Gemini,
                deadlines(),
                &mut h.downstream,
            )
            .await;
        assert_eq!(exit, Exit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_upstream_hits_first_byte_deadline() {
        let config = RelayConfig::default()
            .first_byte_timeout(Duration::from_secs(2))
            .session_timeout(Duration::from_secs(60));
        let mut h = downstream(4);
        let mut session = streaming_session();

        let exit = session
            .pump(
                stream::pending::<Result<Bytes, RelayFailure>>(),
                ProviderKind::OpenAi,
                Deadlines::from_config(&config),
                &mut h.downstream,
            )
            .await;
        match exit {
            Exit::Failed(RelayFailure::Upstream { category, message }) => {
                assert_eq!(category, ErrorCategory::Unavailable);
                assert!(message.contains("first-byte"));
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_after_first_byte_hits_session_deadline() {
        let config = RelayConfig::default()
            .first_byte_timeout(Duration::from_secs(2))
            .session_timeout(Duration::from_secs(10));
        let mut h = downstream(4);
        let mut session = streaming_session();
        let body = stream::iter(chunks(&[&openai_line("a")])).chain(stream::pending());

        let exit = session
            .pump(body, ProviderKind::OpenAi, Deadlines::from_config(&config), &mut h.downstream)
            .await;
        assert!(
            matches!(exit, Exit::Failed(RelayFailure::Upstream { ref message, .. }) if message.contains("maximum duration"))
        );
        assert_eq!(drain_fragments(&mut h.rx), vec!["a"]);
    }

    #[tokio::test]
    async fn failure_sends_exactly_one_error_event() {
        let mut h = downstream(4);
        let mut session = RelaySession::new(uuid::Uuid::new_v4(), 64);
        let failure = RelayFailure::client_input("message must not be empty");

        let result = session
            .terminate(Exit::Failed(failure.clone()), None, deadlines(), &h.downstream)
            .await;
        assert_eq!(result, Err(RelayError::Failed(failure.clone())));
        assert_eq!(session.state(), SessionState::Failed);

        drop(h.downstream);
        assert_eq!(h.rx.recv().await, Some(RelayEvent::Error(failure)));
        assert_eq!(h.rx.recv().await, None);
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_one_error_after_forwarded_fragments() {
        let mut items = chunks(&[&openai_line("a"), &openai_line("b")]);
        items.push(Err(RelayFailure::transport("connection reset")));
        items.extend(chunks(&[&openai_line("never")]));
        let mut h = downstream(16);
        let mut session = streaming_session();

        let exit = session
            .pump(stream::iter(items), ProviderKind::OpenAi, deadlines(), &mut h.downstream)
            .await;
        let result = session
            .terminate(exit, Some(ProviderKind::OpenAi), deadlines(), &h.downstream)
            .await;
        assert!(matches!(result, Err(RelayError::Failed(RelayFailure::Transport { .. }))));

        drop(h.downstream);
        let mut events = Vec::new();
        while let Some(event) = h.rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                RelayEvent::Fragment { seq: 0, text: "a".into() },
                RelayEvent::Fragment { seq: 1, text: "b".into() },
                RelayEvent::Error(RelayFailure::transport("connection reset")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_grace_stops_at_session_deadline() {
        let config = RelayConfig::default()
            .first_byte_timeout(Duration::from_secs(1))
            .session_timeout(Duration::from_secs(2));
        let deadlines = Deadlines::from_config(&config);
        let h = downstream(1);
        h.downstream
            .tx
            .try_send(RelayEvent::Fragment { seq: 0, text: "unread".into() })
            .expect("buffer slot");
        let mut session = streaming_session();

        let started = Instant::now();
        let result = session
            .terminate(
                Exit::Failed(deadlines.expired(false)),
                Some(ProviderKind::OpenAi),
                deadlines,
                &h.downstream,
            )
            .await;

        assert!(matches!(result, Err(RelayError::Failed(_))));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2), "waited {waited:?}");
        assert!(waited < TERMINAL_SEND_GRACE, "waited {waited:?}");
    }
}
