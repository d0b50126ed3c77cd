//! API-client side of the playground: provider configuration, the streaming
//! request contract and the typed failures a chat-completion endpoint can raise.

use std::sync::Arc;

mod error;
mod provider;
mod rig_adapter;

pub use error::{ApiErrorKind, ApiFailure};
pub use provider::{
    LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, SamplingParams, StreamEvent,
    StreamRequest, make_event_stream,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "openai-compatible" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            tracing::debug!(base_url = %config.base_url, "creating rig openai provider");
            Ok(Arc::new(RigProviderAdapter::new(config)))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
