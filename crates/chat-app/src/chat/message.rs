use parley_llm::{ProviderMessage, Role};
use parley_storage::SessionId;
use serde::{Deserialize, Deserializer, Serialize};

/// Display name every session starts with.
pub const DEFAULT_SESSION_NAME: &str = "New Chat";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "You",
            Self::Bot => "Assistant",
        }
    }
}

/// One transcript record.
///
/// Error messages are always authored by the bot; decoding normalizes stored data that
/// says otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub content: String,
    pub sender: Sender,
    pub error: bool,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender: Sender::User,
            error: false,
        }
    }

    pub fn bot(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender: Sender::Bot,
            error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sender: Sender::Bot,
            error: true,
        }
    }

    /// Builds a message from raw parts, keeping the error-implies-bot invariant.
    pub fn from_parts(content: impl Into<String>, sender: Sender, error: bool) -> Self {
        if error {
            Self::error(content)
        } else {
            Self {
                content: content.into(),
                sender,
                error: false,
            }
        }
    }

    pub fn to_provider_message(&self) -> ProviderMessage {
        let role = match self.sender {
            Sender::User => Role::User,
            Sender::Bot => Role::Assistant,
        };
        ProviderMessage::new(role, self.content.clone())
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawMessage {
            #[serde(default)]
            content: String,
            sender: Sender,
            #[serde(default)]
            error: bool,
        }

        let raw = RawMessage::deserialize(deserializer)?;
        Ok(Self::from_parts(raw.content, raw.sender, raw.error))
    }
}

/// One named conversation and its transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    #[serde(default)]
    pub conversation: Vec<Message>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            name: DEFAULT_SESSION_NAME.to_string(),
            conversation: Vec::new(),
        }
    }

    /// True exactly when the transcript is the first `[user, bot]` exchange and the bot
    /// turn is a real reply.
    pub fn is_first_exchange(&self) -> bool {
        matches!(
            self.conversation.as_slice(),
            [first, second]
                if first.sender == Sender::User && second.sender == Sender::Bot && !second.error
        )
    }
}
