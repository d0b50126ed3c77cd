use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::error::ApiFailure;
use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu, LlmProvider, ProviderConfig,
    ProviderError, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role,
    SamplingParams, StreamEvent, StreamRequest, make_event_stream,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

type RigStreamingResponse =
    rig::streaming::StreamingCompletionResponse<openai::completion::streaming::StreamingCompletionResponse>;

/// OpenAI-compatible chat provider backed by rig.
pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    /// Chat Completions client (`POST {base_url}/chat/completions`).
    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::CompletionsClient> {
        let api_token = config.api_token.as_deref().unwrap_or_default();
        let mut builder = openai::Client::builder().api_key(api_token);
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        let client = builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })?;
        Ok(client.completions_api())
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        // Rig exposes a single preamble field, so system-role messages are folded into it.
        let parts = request
            .messages
            .iter()
            .filter(|message| matches!(message.role, Role::System))
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| message.content.clone())
            .collect::<Vec<_>>();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Sampling fields rig has no typed setter for.
    ///
    /// Only values that differ from the endpoint defaults are sent, since some
    /// OpenAI-compatible servers reject parameters they do not implement.
    fn additional_params(sampling: &SamplingParams) -> Option<serde_json::Value> {
        let mut params = serde_json::Map::new();
        if sampling.top_p != 1.0 {
            params.insert("top_p".to_string(), sampling.top_p.into());
        }
        if sampling.frequency_penalty != 0.0 {
            params.insert(
                "frequency_penalty".to_string(),
                sampling.frequency_penalty.into(),
            );
        }
        if sampling.presence_penalty != 0.0 {
            params.insert(
                "presence_penalty".to_string(),
                sampling.presence_penalty.into(),
            );
        }

        if params.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(params))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                model_id: request.model_id.clone(),
            }
            .fail();
        };

        let mut builder = model
            .completion_request(prompt)
            .messages(messages)
            .temperature(request.sampling.temperature)
            .max_tokens(request.sampling.max_tokens);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(params) = Self::additional_params(&request.sampling) {
            builder = builder.additional_params(params);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_failure(event_tx: &mpsc::UnboundedSender<StreamEvent>, error: &ProviderError) {
        let failure = error
            .api_failure()
            .unwrap_or_else(|| ApiFailure::from_description(error.to_string()));
        let _ = event_tx.send(StreamEvent::Failed(failure));
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> StreamEvent
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => StreamEvent::Delta(Some(text.text)),
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => StreamEvent::Metadata,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let mut stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_failure(&event_tx, &error);
                return;
            }
        };

        tracing::debug!(model_id = %request.model_id, "provider stream opened");

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Cancel the upstream rig stream so provider IO stops promptly.
                    tracing::debug!(model_id = %request.model_id, "provider stream cancelled");
                    stream.cancel();
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if event_tx.send(Self::map_stream_item(item)).is_err() {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                model_id = %request.model_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_failure(&event_tx, &error);
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = event_tx.send(StreamEvent::Done);
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "OpenAI-compatible (rig)"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            request
                .messages
                .iter()
                .any(|message| !matches!(message.role, Role::System)),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                model_id: request.model_id.clone(),
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<ProviderMessage>) -> StreamRequest {
        StreamRequest::new("llama3.1", messages)
    }

    #[test]
    fn system_messages_fold_into_preamble() {
        let request = request(vec![
            ProviderMessage::new(Role::System, "Be brief."),
            ProviderMessage::new(Role::System, "   "),
            ProviderMessage::new(Role::User, "hi"),
        ]);
        assert_eq!(
            RigProviderAdapter::merged_preamble(&request).as_deref(),
            Some("Be brief.")
        );
    }

    #[test]
    fn default_sampling_sends_no_additional_params() {
        assert!(RigProviderAdapter::additional_params(&SamplingParams::default()).is_none());
    }

    #[test]
    fn non_default_sampling_is_forwarded() {
        let sampling = SamplingParams {
            top_p: 0.5,
            presence_penalty: -1.0,
            ..SamplingParams::default()
        };
        let params = RigProviderAdapter::additional_params(&sampling).unwrap();
        assert_eq!(params["top_p"], 0.5);
        assert_eq!(params["presence_penalty"], -1.0);
        assert!(params.get("frequency_penalty").is_none());
    }

    #[test]
    fn system_only_payload_is_rejected_before_any_io() {
        let adapter = RigProviderAdapter::new(ProviderConfig::new(
            RIG_OPENAI_PROVIDER_ID,
            "http://localhost:11434/v1",
            None,
        ));
        let result = adapter.stream_chat(request(vec![ProviderMessage::new(
            Role::System,
            "You are a helpful assistant.",
        )]));

        match result {
            Err(error @ ProviderError::EmptyMessageSet { .. }) => {
                assert!(error.api_failure().is_none());
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected system-only payload to be rejected"),
        }
    }

    /// Serves one canned SSE reply and hands back the raw request it received.
    fn serve_once(reply: &'static str) -> (String, std::sync::mpsc::Receiver<String>) {
        use std::io::{BufRead, BufReader, Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}/v1", listener.local_addr().unwrap());
        let (request_tx, request_rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());
            let mut head = String::new();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                head.push_str(&line);
            }
            let mut body = vec![0; content_length];
            reader.read_exact(&mut body).unwrap();
            head.push_str(&String::from_utf8_lossy(&body));
            request_tx.send(head).unwrap();

            let mut socket = socket;
            write!(
                socket,
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{reply}"
            )
            .unwrap();
            socket.flush().unwrap();
        });

        (base_url, request_rx)
    }

    #[tokio::test]
    async fn streams_from_chat_completions_endpoint() {
        let (base_url, request_rx) = serve_once(concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}],\"usage\":null}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":null}\n\n",
            "data: [DONE]\n\n",
        ));
        let adapter = RigProviderAdapter::new(ProviderConfig::new(
            RIG_OPENAI_PROVIDER_ID,
            base_url,
            Some("sk-local".into()),
        ));
        let request = request(vec![
            ProviderMessage::new(Role::System, "Be brief."),
            ProviderMessage::new(Role::User, "hello"),
        ])
        .with_sampling(SamplingParams {
            frequency_penalty: 0.5,
            ..SamplingParams::default()
        });

        let handle = adapter.stream_chat(request).unwrap();
        tokio::spawn(handle.worker);
        let events = handle.stream.collect::<Vec<_>>().await;

        let raw_request = request_rx.recv().unwrap();
        assert!(
            raw_request.starts_with("POST /v1/chat/completions HTTP/1.1"),
            "unexpected request: {raw_request}"
        );
        assert!(raw_request.contains("\"stream\":true"));
        assert!(raw_request.contains("\"frequency_penalty\":0.5"));
        assert!(raw_request.contains("Be brief."));

        assert!(events.contains(&StreamEvent::Delta(Some("Hi".to_string()))));
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }
}
