use std::sync::Arc;

mod client;
mod provider;
mod rig_adapter;

pub use client::{
    CompletionClient, CompletionFailure, FALLBACK_TITLE, TITLE_SYSTEM_PROMPT, clean_title,
};
pub use provider::{
    BoxFuture, CompletionRequest, DEFAULT_MODEL, LlmProvider, ProviderConfig, ProviderError,
    ProviderMessage, ProviderResult, Role,
};
pub use rig_adapter::{RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" | "openrouter" | "openai-compatible" => {
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
