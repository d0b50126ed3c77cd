use std::future::Future;
use std::time::Instant;

use futures::{Stream, StreamExt};
use playground_llm::{ApiFailure, StreamEvent};

use super::clock::Clock;
use super::metrics::StreamMetrics;
use super::tokens::TokenEstimator;

/// Glyph appended to in-progress text while a response is still streaming.
pub const CURSOR_GLYPH: &str = "▌";
/// Prefix that marks a finalized message as an error instead of model output.
pub const ERROR_MARKER: &str = "❌ Error: ";

pub fn format_error_text(failure: &ApiFailure) -> String {
    format!("{ERROR_MARKER}{failure}")
}

/// Lifecycle of one streamed response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming,
    Complete,
    Failed(ApiFailure),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start,
    Complete,
    Fail(ApiFailure),
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming,
    NoActiveStream,
}

impl StreamPhase {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    /// Applies one transition.
    ///
    /// Only an idle or finished phase may start, and only a streaming phase may
    /// complete, fail or be cancelled.
    pub fn apply(
        &self,
        transition: StreamTransition,
    ) -> Result<StreamPhase, StreamTransitionRejection> {
        match (self, transition) {
            (Self::Streaming, StreamTransition::Start) => {
                Err(StreamTransitionRejection::AlreadyStreaming)
            }
            (_, StreamTransition::Start) => Ok(Self::Streaming),
            (Self::Streaming, StreamTransition::Complete) => Ok(Self::Complete),
            (Self::Streaming, StreamTransition::Fail(failure)) => Ok(Self::Failed(failure)),
            (Self::Streaming, StreamTransition::Cancel) => Ok(Self::Cancelled),
            (
                Self::Idle | Self::Complete | Self::Failed(_) | Self::Cancelled,
                StreamTransition::Complete | StreamTransition::Fail(_) | StreamTransition::Cancel,
            ) => Err(StreamTransitionRejection::NoActiveStream),
        }
    }
}

/// Result of draining one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub phase: StreamPhase,
    /// Model output, or the error-marked text when the stream failed.
    pub text: String,
    pub metrics: StreamMetrics,
}

impl StreamOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self.phase, StreamPhase::Failed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.phase, StreamPhase::Cancelled)
    }
}

/// Accumulates one streamed response and times it.
///
/// Creating the consumer marks `request_start`, so it must happen right before
/// the request is dispatched.
pub struct StreamConsumer<'a> {
    estimator: &'a TokenEstimator,
    clock: &'a dyn Clock,
    phase: StreamPhase,
    request_start: Instant,
    first_token_time: Option<Instant>,
    accumulated: String,
    tokens_so_far: usize,
}

impl<'a> StreamConsumer<'a> {
    pub fn start(estimator: &'a TokenEstimator, clock: &'a dyn Clock) -> Self {
        let request_start = clock.now();
        tracing::debug!("stream consumer started");

        Self {
            estimator,
            clock,
            phase: StreamPhase::Streaming,
            request_start,
            first_token_time: None,
            accumulated: String::new(),
            tokens_so_far: 0,
        }
    }

    pub fn phase(&self) -> &StreamPhase {
        &self.phase
    }

    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn tokens_so_far(&self) -> usize {
        self.tokens_so_far
    }

    pub fn request_start(&self) -> Instant {
        self.request_start
    }

    pub fn first_token_time(&self) -> Option<Instant> {
        self.first_token_time
    }

    /// Appends one content delta and returns the live metrics at its arrival.
    ///
    /// Empty deltas are ignored and do not read the clock, so they can never
    /// move the TTFT boundary.
    pub fn push_delta(&mut self, delta: &str) -> Option<StreamMetrics> {
        if delta.is_empty() || !self.phase.is_streaming() {
            return None;
        }

        let now = self.clock.now();
        let first_token_time = *self.first_token_time.get_or_insert(now);
        self.accumulated.push_str(delta);
        self.tokens_so_far += self.estimator.estimate(delta);

        Some(StreamMetrics::compute(
            self.request_start,
            Some(first_token_time),
            self.tokens_so_far,
            now,
        ))
    }

    /// Drains an already-materialized sequence of events.
    pub fn consume_events<I, F>(mut self, events: I, mut on_chunk: F) -> StreamOutcome
    where
        I: IntoIterator<Item = StreamEvent>,
        F: FnMut(&str, &StreamMetrics),
    {
        for event in events {
            if let Some(transition) = self.observe(event, &mut on_chunk) {
                return self.finish(transition);
            }
        }

        self.finish(StreamTransition::Complete)
    }

    /// Drains a provider stream in arrival order until it ends, fails or `cancel` resolves.
    ///
    /// `cancel` is checked at every chunk boundary; cancelling keeps the partial
    /// text and computes metrics the same way a normal completion does.
    pub async fn consume<S, C, F>(
        mut self,
        mut stream: S,
        cancel: C,
        mut on_chunk: F,
    ) -> StreamOutcome
    where
        S: Stream<Item = StreamEvent> + Unpin,
        C: Future<Output = ()>,
        F: FnMut(&str, &StreamMetrics),
    {
        let mut cancel = std::pin::pin!(cancel);

        loop {
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    tracing::info!(
                        accumulated_len = self.accumulated.len(),
                        "stream cancelled by user"
                    );
                    return self.finish(StreamTransition::Cancel);
                }
                event = stream.next() => {
                    let Some(event) = event else {
                        return self.finish(StreamTransition::Complete);
                    };
                    if let Some(transition) = self.observe(event, &mut on_chunk) {
                        return self.finish(transition);
                    }
                }
            }
        }
    }

    pub fn fail(self, failure: ApiFailure) -> StreamOutcome {
        self.finish(StreamTransition::Fail(failure))
    }

    fn observe<F>(&mut self, event: StreamEvent, on_chunk: &mut F) -> Option<StreamTransition>
    where
        F: FnMut(&str, &StreamMetrics),
    {
        match event {
            StreamEvent::Done => Some(StreamTransition::Complete),
            StreamEvent::Failed(failure) => Some(StreamTransition::Fail(failure)),
            event @ (StreamEvent::Delta(_) | StreamEvent::Metadata) => {
                if let Some(delta) = event.content()
                    && let Some(metrics) = self.push_delta(delta)
                {
                    on_chunk(&self.accumulated, &metrics);
                }
                None
            }
        }
    }

    fn finish(mut self, transition: StreamTransition) -> StreamOutcome {
        let now = self.clock.now();
        match self.phase.apply(transition) {
            Ok(next) => self.phase = next,
            Err(rejection) => {
                tracing::warn!(?rejection, phase = ?self.phase, "ignoring illegal stream transition");
            }
        }

        let metrics = match self.phase {
            StreamPhase::Failed(_) => StreamMetrics::empty(),
            _ => StreamMetrics::compute(
                self.request_start,
                self.first_token_time,
                self.tokens_so_far,
                now,
            ),
        };
        let text = match &self.phase {
            StreamPhase::Failed(failure) => {
                tracing::warn!(
                    kind = ?failure.kind,
                    error = %failure.message,
                    discarded_len = self.accumulated.len(),
                    "stream failed"
                );
                format_error_text(failure)
            }
            _ => std::mem::take(&mut self.accumulated),
        };

        tracing::info!(
            phase = ?self.phase,
            ttft_ms = ?metrics.ttft_millis(),
            total_tokens = metrics.total_tokens,
            tps = metrics.tps,
            "stream finished"
        );

        StreamOutcome {
            phase: self.phase,
            text,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use playground_llm::{ApiErrorKind, make_event_stream};

    use super::*;
    use crate::stream::clock::ScriptedClock;

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::Delta(Some(text.to_string()))
    }

    #[test]
    fn hello_world_scenario() {
        let estimator = TokenEstimator::heuristic_only();
        let base = Instant::now();
        // request start, three chunk arrivals, completion.
        let clock = ScriptedClock::from_millis(base, [0, 10, 50, 90, 90]);

        let mut frames = Vec::new();
        let outcome = StreamConsumer::start(&estimator, &clock).consume_events(
            vec![delta("Hel"), delta("lo, "), delta("world!"), StreamEvent::Done],
            |text, metrics| frames.push((text.to_string(), *metrics)),
        );

        assert_eq!(outcome.phase, StreamPhase::Complete);
        assert_eq!(outcome.text, "Hello, world!");
        assert_eq!(outcome.metrics.total_tokens, 3);
        let ttft = outcome.metrics.ttft_seconds.unwrap();
        assert!((ttft - 0.010).abs() < 1e-9);
        assert!((outcome.metrics.generation_seconds - 0.080).abs() < 1e-9);
        assert!((outcome.metrics.tps - 37.5).abs() < 1e-6);

        let texts = frames.iter().map(|(text, _)| text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, ["Hel", "Hello, ", "Hello, world!"]);
        // The first live frame sits exactly on the TTFT boundary.
        assert_eq!(frames[0].1.generation_seconds, crate::stream::metrics::MIN_GENERATION_SECONDS);
        assert!(frames.iter().all(|(_, metrics)| metrics.ttft_seconds == Some(ttft)));
    }

    #[test]
    fn empty_stream_has_no_ttft() {
        let estimator = TokenEstimator::heuristic_only();
        let clock = ScriptedClock::from_millis(Instant::now(), [0, 40]);

        let outcome = StreamConsumer::start(&estimator, &clock)
            .consume_events(Vec::new(), |_, _| panic!("no chunk expected"));

        assert_eq!(outcome.phase, StreamPhase::Complete);
        assert_eq!(outcome.text, "");
        assert_eq!(outcome.metrics, StreamMetrics::empty());
    }

    #[test]
    fn control_frames_neither_accumulate_nor_start_ttft() {
        let estimator = TokenEstimator::heuristic_only();
        let base = Instant::now();
        let clock = ScriptedClock::from_millis(base, [0, 30, 60]);

        let mut consumer = StreamConsumer::start(&estimator, &clock);
        assert_eq!(consumer.push_delta(""), None);
        assert_eq!(consumer.first_token_time(), None);

        let outcome = consumer.consume_events(
            vec![
                StreamEvent::Metadata,
                StreamEvent::Delta(None),
                StreamEvent::Delta(Some(String::new())),
                delta("ok"),
            ],
            |_, _| {},
        );

        assert_eq!(outcome.text, "ok");
        let ttft = outcome.metrics.ttft_seconds.unwrap();
        assert!((ttft - 0.030).abs() < 1e-9);
    }

    #[test]
    fn first_token_time_is_set_once() {
        let estimator = TokenEstimator::heuristic_only();
        let base = Instant::now();
        let clock = ScriptedClock::from_millis(base, [0, 5, 7, 9]);

        let mut consumer = StreamConsumer::start(&estimator, &clock);
        consumer.push_delta("a");
        consumer.push_delta("b");
        consumer.push_delta("c");

        assert_eq!(
            consumer.first_token_time(),
            Some(base + Duration::from_millis(5))
        );
        assert_eq!(consumer.tokens_so_far(), 3);
    }

    #[test]
    fn failure_replaces_partial_content_and_zeroes_metrics() {
        let estimator = TokenEstimator::heuristic_only();
        let clock = ScriptedClock::from_millis(Instant::now(), [0, 10, 20]);
        let failure = ApiFailure::new(ApiErrorKind::RateLimit, "slow down");

        let outcome = StreamConsumer::start(&estimator, &clock).consume_events(
            vec![delta("partial"), StreamEvent::Failed(failure.clone())],
            |_, _| {},
        );

        assert!(outcome.is_error());
        assert_eq!(outcome.phase, StreamPhase::Failed(failure));
        assert_eq!(outcome.text, "❌ Error: rate limit exceeded: slow down");
        assert!(outcome.text.starts_with(ERROR_MARKER));
        assert_eq!(outcome.metrics, StreamMetrics::empty());
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let estimator = TokenEstimator::heuristic_only();
        let clock = ScriptedClock::from_millis(Instant::now(), [0, 1, 2]);

        let outcome = StreamConsumer::start(&estimator, &clock).consume_events(
            vec![delta("kept"), StreamEvent::Done, delta("dropped")],
            |_, _| {},
        );
        assert_eq!(outcome.text, "kept");
    }

    #[tokio::test]
    async fn async_stream_is_consumed_in_order() {
        let estimator = TokenEstimator::heuristic_only();
        let clock = ScriptedClock::from_millis(Instant::now(), [0, 10, 20, 30]);
        let (tx, stream, _cancel_rx) = make_event_stream();
        for event in [delta("one "), delta("two"), StreamEvent::Done] {
            tx.send(event).unwrap();
        }

        let mut seen = Vec::new();
        let outcome = StreamConsumer::start(&estimator, &clock)
            .consume(stream, std::future::pending::<()>(), |text, _| {
                seen.push(text.to_string())
            })
            .await;

        assert_eq!(outcome.phase, StreamPhase::Complete);
        assert_eq!(outcome.text, "one two");
        assert_eq!(seen, ["one ", "one two"]);
        assert_eq!(outcome.metrics.total_tokens, 2);
    }

    #[tokio::test]
    async fn cancellation_keeps_partial_text_and_metrics() {
        let estimator = TokenEstimator::heuristic_only();
        let clock = ScriptedClock::from_millis(Instant::now(), [0, 10, 110]);
        let (tx, stream, _cancel_rx) = make_event_stream();
        tx.send(delta("partial answer")).unwrap();

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
        let cancel = async move {
            let _ = cancel_rx.await;
        };

        // Request cancellation from inside the first chunk callback; the next
        // chunk boundary must honour it even though the sender is still open.
        let mut cancel_tx = Some(cancel_tx);
        let outcome = StreamConsumer::start(&estimator, &clock)
            .consume(stream, cancel, |_, _| {
                if let Some(cancel_tx) = cancel_tx.take() {
                    let _ = cancel_tx.send(());
                }
            })
            .await;
        drop(tx);

        assert!(outcome.is_cancelled());
        assert_eq!(outcome.text, "partial answer");
        assert_eq!(outcome.metrics.total_tokens, 2);
        assert!((outcome.metrics.generation_seconds - 0.100).abs() < 1e-9);
    }

    #[test]
    fn phase_machine_rejects_illegal_transitions() {
        assert_eq!(
            StreamPhase::Streaming.apply(StreamTransition::Start),
            Err(StreamTransitionRejection::AlreadyStreaming)
        );
        assert_eq!(
            StreamPhase::Idle.apply(StreamTransition::Complete),
            Err(StreamTransitionRejection::NoActiveStream)
        );
        assert_eq!(
            StreamPhase::Complete.apply(StreamTransition::Start),
            Ok(StreamPhase::Streaming)
        );
    }
}
