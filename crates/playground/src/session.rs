use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use playground_llm::{LlmProvider, ProviderError, StreamRequest};
use snafu::{ResultExt, Snafu};

use crate::chat::{ConversationStore, Message, Role};
use crate::config::{RequestConfig, ValidationError};
use crate::stream::{
    CURSOR_GLYPH, Clock, MetricsRecorder, StreamConsumer, StreamMetrics, StreamOutcome,
    SystemClock, TokenEstimator, shared_estimator,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("{source}"))]
    Validation {
        stage: &'static str,
        source: ValidationError,
    },
    #[snafu(display("prompt is empty"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("provider rejected the request on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
}

/// What the display collaborator receives for every update.
#[derive(Debug, Clone, Copy)]
pub struct RenderFrame<'a> {
    pub text: &'a str,
    /// True while the response is still streaming.
    pub cursor: bool,
    pub metrics: &'a StreamMetrics,
}

impl<'a> RenderFrame<'a> {
    pub fn streaming(text: &'a str, metrics: &'a StreamMetrics) -> Self {
        Self {
            text,
            cursor: true,
            metrics,
        }
    }

    pub fn finished(outcome: &'a StreamOutcome) -> Self {
        Self {
            text: &outcome.text,
            cursor: false,
            metrics: &outcome.metrics,
        }
    }

    pub fn display_text(&self) -> Cow<'a, str> {
        if self.cursor {
            Cow::Owned(format!("{}{CURSOR_GLYPH}", self.text))
        } else {
            Cow::Borrowed(self.text)
        }
    }
}

pub trait StreamDisplay {
    fn render(&mut self, frame: RenderFrame<'_>);
}

/// Footer figures for the current transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub message_count: usize,
    pub total_characters: usize,
}

/// State of one interactive session: transcript, last metrics and the shared
/// token estimator.
///
/// `submit` takes `&mut self`, so a session can never have two requests in
/// flight at once.
pub struct ChatSession {
    conversation: ConversationStore,
    metrics: MetricsRecorder,
    estimator: Arc<TokenEstimator>,
    clock: Arc<dyn Clock>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self::with_parts(shared_estimator(), Arc::new(SystemClock))
    }

    pub fn with_parts(estimator: Arc<TokenEstimator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            conversation: ConversationStore::new(),
            metrics: MetricsRecorder::default(),
            estimator,
            clock,
        }
    }

    pub fn conversation(&self) -> &ConversationStore {
        &self.conversation
    }

    pub fn last_metrics(&self) -> Option<&StreamMetrics> {
        self.metrics.last()
    }

    pub fn delete_message(&mut self, index: usize) -> Option<Message> {
        let removed = self.conversation.delete_at(index);
        if removed.is_some() {
            tracing::debug!(index, "deleted message");
        }
        removed
    }

    pub fn clear(&mut self) {
        tracing::debug!(
            message_count = self.conversation.len(),
            "clearing conversation"
        );
        self.conversation.clear();
    }

    /// Replaces the transcript, e.g. with a previously exported conversation.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.conversation = ConversationStore::from_messages(messages);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            message_count: self.conversation.len(),
            total_characters: self.conversation.total_characters(),
        }
    }

    /// Runs one user turn end to end.
    ///
    /// Validation failures return before anything is appended or sent.
    /// API-originated failures are not errors here: they become an error-marked
    /// assistant message so the transcript shows them. Only local provider
    /// faults are returned as `Err`, after rolling back the user message.
    pub async fn submit<D, C>(
        &mut self,
        prompt: &str,
        config: &RequestConfig,
        provider: &dyn LlmProvider,
        display: &mut D,
        cancel: C,
    ) -> Result<StreamOutcome, SessionError>
    where
        D: StreamDisplay + ?Sized,
        C: Future<Output = ()>,
    {
        config.validate().context(ValidationSnafu {
            stage: "validate-request-config",
        })?;
        if prompt.trim().is_empty() {
            return EmptyPromptSnafu {
                stage: "validate-prompt",
            }
            .fail();
        }

        self.conversation.append(Role::User, prompt);

        let messages = self
            .conversation
            .to_request_payload(&config.system_prompt)
            .iter()
            .map(Message::to_provider)
            .collect::<Vec<_>>();
        let request = StreamRequest::new(config.model_id(), messages).with_sampling(config.sampling());

        tracing::info!(
            provider_id = %provider.id(),
            model_id = %config.model_id(),
            message_count = request.messages.len(),
            "submitting chat request"
        );

        let consumer = StreamConsumer::start(&self.estimator, self.clock.as_ref());
        let outcome = match provider.stream_chat(request) {
            Ok(handle) => {
                tokio::spawn(handle.worker);
                consumer
                    .consume(handle.stream, cancel, |text, metrics| {
                        display.render(RenderFrame::streaming(text, metrics));
                    })
                    .await
            }
            Err(error) => match error.api_failure() {
                Some(failure) => consumer.fail(failure),
                None => {
                    self.conversation.delete_at(self.conversation.len() - 1);
                    tracing::error!(error = %error, "provider refused to open a stream");
                    return Err(error).context(ProviderSnafu {
                        stage: "open-provider-stream",
                    });
                }
            },
        };

        display.render(RenderFrame::finished(&outcome));
        self.conversation
            .append(Role::Assistant, outcome.text.clone());
        self.metrics.record(outcome.metrics);

        Ok(outcome)
    }
}
