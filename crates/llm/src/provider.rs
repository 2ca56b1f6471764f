use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let mut model = model.into().trim().to_string();
        if model.is_empty() {
            model = DEFAULT_MODEL.to_string();
        }

        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model,
        }
    }
}

/// Chat speaker role on the wire.
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

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One request/response cycle: a system preamble plus a single user prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model_id: String,
    pub preamble: String,
    pub prompt: String,
}

impl CompletionRequest {
    pub fn new(
        model_id: impl Into<String>,
        preamble: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            preamble: preamble.into(),
            prompt: prompt.into(),
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("completion request has an empty prompt"))]
    EmptyPrompt { stage: &'static str },
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
    #[snafu(display("provider response carried no assistant text on `{stage}`"))]
    MissingReply { stage: &'static str },
}

impl ProviderError {
    /// True when the request reached the provider but the reply could not be used.
    pub fn is_malformed_response(&self) -> bool {
        match self {
            Self::MissingReply { .. } => true,
            Self::CompletionsFailed { source, .. } => matches!(
                source,
                rig::completion::CompletionError::JsonError(_)
                    | rig::completion::CompletionError::ResponseError(_)
            ),
            Self::MissingApiKey { .. }
            | Self::UnsupportedProvider { .. }
            | Self::EmptyPrompt { .. }
            | Self::HttpClient { .. } => false,
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn complete<'a>(&'a self, request: CompletionRequest) -> BoxFuture<'a, ProviderResult<String>>;
}
