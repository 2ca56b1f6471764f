use rig::completion::{CompletionModel, Message as RigMessage};
use rig::completion::message::AssistantContent;
use rig::prelude::CompletionClient;
use rig::providers::openai;
use snafu::{ResultExt, ensure};

use super::provider::{
    BoxFuture, CompletionRequest, CompletionsFailedSnafu, EmptyPromptSnafu, HttpClientSnafu,
    LlmProvider, MissingApiKeySnafu, MissingReplySnafu, ProviderConfig, ProviderResult,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";

/// OpenAI-compatible chat-completions adapter.
///
/// The wire request is `[system: preamble, user: prompt]` and the reply is read from the
/// first choice, which also covers OpenRouter and self-hosted compatible servers.
pub struct RigProviderAdapter {
    config: ProviderConfig,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn collect_reply_text(choice: impl IntoIterator<Item = AssistantContent>) -> String {
        // Reasoning and tool-call parts are not part of the visible reply.
        choice
            .into_iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    async fn send_completion(
        config: &ProviderConfig,
        request: CompletionRequest,
    ) -> ProviderResult<String> {
        let client = Self::build_client(config)?;
        let model = client
            .completion_model(request.model_id.clone())
            .completions_api();

        let response = model
            .completion_request(RigMessage::user(request.prompt))
            .preamble(request.preamble)
            .send()
            .await.context(CompletionsFailedSnafu {
            stage: "send-completion",
        })?;

        let reply = Self::collect_reply_text(response.choice);
        ensure!(
            !reply.trim().is_empty(),
            MissingReplySnafu {
                stage: "read-completion-choice",
            }
        );

        Ok(reply)
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI-compatible"
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    fn complete<'a>(&'a self, request: CompletionRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            ensure!(
                !request.prompt.trim().is_empty(),
                EmptyPromptSnafu {
                    stage: "rig-adapter-complete",
                }
            );

            let model_id = request.model_id.clone();
            match Self::send_completion(&self.config, request).await {
                Ok(reply) => {
                    tracing::debug!(
                        provider_id = %self.config.provider_id,
                        model_id = %model_id,
                        reply_bytes = reply.len(),
                        "completion succeeded"
                    );
                    Ok(reply)
                }
                Err(error) => {
                    tracing::warn!(
                        provider_id = %self.config.provider_id,
                        model_id = %model_id,
                        error = %error,
                        "completion failed"
                    );
                    Err(error)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderError;

    #[test]
    fn rejects_empty_api_key() {
        let config = ProviderConfig::new("openai", "  ", "", "");
        let error = RigProviderAdapter::new(config)
            .err()
            .expect("empty key must be rejected");
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));
    }

    #[test]
    fn blank_model_falls_back_to_default() {
        let config = ProviderConfig::new("openai", "sk-test", "", " ");
        let adapter = RigProviderAdapter::new(config).expect("adapter");
        assert_eq!(adapter.default_model(), crate::DEFAULT_MODEL);
    }
}
