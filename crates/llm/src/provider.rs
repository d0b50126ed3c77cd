use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::error::{ApiErrorKind, ApiFailure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub base_url: String,
    pub api_token: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        api_token: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            base_url: base_url.into().trim().to_string(),
            // Some local runtimes accept anonymous requests, so a blank token means "none".
            api_token: api_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        }
    }
}

/// Chat speaker role as sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Sampling knobs forwarded verbatim to the completion endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub sampling: SamplingParams,
}

impl StreamRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

/// One unit delivered by a provider stream, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// First-choice content delta; `None` when the frame carried no content.
    Delta(Option<String>),
    /// Reasoning, tool-call or usage frames that never reach the transcript.
    Metadata,
    Done,
    Failed(ApiFailure),
}

impl StreamEvent {
    /// Returns the content delta if this frame carries visible text.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Delta(Some(text)) if !text.is_empty() => Some(text.as_str()),
            Self::Delta(_) | Self::Metadata | Self::Done | Self::Failed(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for model '{model_id}' has no user or assistant messages"))]
    EmptyMessageSet {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("provider stream ended before a terminal event"))]
    StreamClosed { stage: &'static str },
}

impl ProviderError {
    /// Classifies failures that originate from the remote API.
    ///
    /// Local faults (unknown provider, empty payload) return `None` and are left
    /// for the caller to propagate.
    pub fn api_failure(&self) -> Option<ApiFailure> {
        match self {
            Self::HttpClient { source, .. } => Some(ApiFailure::from_description(source.to_string())),
            Self::CompletionsFailed { source, .. } => {
                Some(ApiFailure::from_description(source.to_string()))
            }
            Self::StreamClosed { .. } => Some(ApiFailure::new(
                ApiErrorKind::Connectivity,
                self.to_string(),
            )),
            Self::UnsupportedProvider { .. } | Self::EmptyMessageSet { .. } => None,
        }
    }
}

/// Receiving half of a provider stream.
///
/// Dropping it tells the worker to abandon the upstream request.
pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
    finished: bool,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
            finished: false,
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.next().await
    }
}

impl Stream for ProviderEventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // The worker went away without Done/Failed; surface that as a failure once.
                self.finished = true;
                let error = ProviderError::StreamClosed {
                    stage: "poll-event-stream",
                };
                let failure = error
                    .api_failure()
                    .unwrap_or_else(|| ApiFailure::new(ApiErrorKind::Api, error.to_string()));
                tracing::warn!(error = %error, "provider stream closed without terminal event");
                Poll::Ready(Some(StreamEvent::Failed(failure)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Creates the sender, receiving stream and cancel signal for one streaming request.
pub fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamEvent>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}
