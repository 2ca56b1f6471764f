use std::sync::Arc;

use snafu::Snafu;

use super::provider::{CompletionRequest, LlmProvider, ProviderError, ProviderMessage, Role};

/// Name used whenever a title cannot be derived.
pub const FALLBACK_TITLE: &str = "New Chat";

pub const TITLE_SYSTEM_PROMPT: &str = "You are a helpful assistant that creates short chat titles.";

/// Failure of a normal send. Both variants are user-visible and retryable.
#[derive(Debug, Snafu)]
pub enum CompletionFailure {
    #[snafu(display("completion transport failed: {source}"))]
    Transport { source: ProviderError },
    #[snafu(display("completion response was malformed: {source}"))]
    MalformedResponse { source: ProviderError },
    #[snafu(display("conversation context has no user turn to send"))]
    EmptyContext,
}

impl CompletionFailure {
    fn from_provider(source: ProviderError) -> Self {
        if source.is_malformed_response() {
            Self::MalformedResponse { source }
        } else {
            Self::Transport { source }
        }
    }
}

/// Sends conversation turns to a provider with a fixed model.
#[derive(Clone)]
pub struct CompletionClient {
    provider: Arc<dyn LlmProvider>,
    model_id: String,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        let model_id = provider.default_model().to_string();
        Self { provider, model_id }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Requests a reply to the latest user turn in `context`.
    ///
    /// Earlier turns are not transmitted; the provider only sees the system prompt and
    /// the newest user message.
    pub async fn complete(
        &self,
        context: &[ProviderMessage],
        system_prompt: &str,
    ) -> Result<String, CompletionFailure> {
        let Some(prompt) = latest_user_turn(context) else {
            return Err(CompletionFailure::EmptyContext);
        };

        let request = CompletionRequest::new(self.model_id.clone(), system_prompt, prompt);
        self.provider
            .complete(request)
            .await
            .map_err(CompletionFailure::from_provider)
    }

    /// Derives a short title from the first exchange. Never fails.
    pub async fn summarize_title(&self, user_message: &str, bot_message: &str) -> String {
        let prompt = format!(
            "Summarize this conversation in 3-5 words for a chat title:\nUser: {user_message}\nAI: {bot_message}"
        );
        let request = CompletionRequest::new(self.model_id.clone(), TITLE_SYSTEM_PROMPT, prompt);

        match self.provider.complete(request).await {
            Ok(raw_title) => clean_title(&raw_title),
            Err(error) => {
                tracing::warn!(
                    provider_id = %self.provider.id(),
                    error = %error,
                    "title generation failed; keeping fallback title"
                );
                FALLBACK_TITLE.to_string()
            }
        }
    }
}

fn latest_user_turn(context: &[ProviderMessage]) -> Option<&str> {
    context
        .iter()
        .rev()
        .find(|message| message.role == Role::User && !message.content.trim().is_empty())
        .map(|message| message.content.as_str())
}

/// Strips quotes and line breaks that models like to wrap titles in.
pub fn clean_title(raw: &str) -> String {
    let cleaned = raw
        .chars()
        .filter(|character| !matches!(character, '"' | '\n'))
        .collect::<String>();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        cleaned.to_string()
    }
}
