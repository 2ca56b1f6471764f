use parley_llm::{CompletionClient, CompletionFailure, ProviderMessage};
use parley_storage::SessionId;
use snafu::{OptionExt, ResultExt, Snafu};

use super::groups::{MessageGroup, MessageGroups};
use super::message::{Message, Sender, Session};
use super::registry::{RegistryError, SessionRegistry};

pub const NETWORK_FAILURE_MESSAGE: &str =
    "Unable to connect to the AI service. Please check your internet connection and try again.";
pub const EMPTY_REPLY_MESSAGE: &str = "Sorry, I could not generate a response. Please try again.";

/// Title shown when no session is active.
pub const NO_SESSION_TITLE: &str = "AI Assistant";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PipelineError {
    #[snafu(display("no chat session is active on `{stage}`"))]
    NoActiveSession { stage: &'static str },
    #[snafu(display("session registry failed on `{stage}`: {source}"))]
    Registry {
        stage: &'static str,
        source: RegistryError,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub system_prompt: String,
    /// Shown (never persisted) when the first session is empty at startup.
    pub welcome_message: Option<String>,
}

/// Routing key for one in-flight completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestTarget {
    pub session_id: SessionId,
    pub request_id: u64,
}

/// A send that has recorded the user turn and awaits its completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub target: RequestTarget,
    pub text: String,
    pub context: Vec<ProviderMessage>,
}

/// Emitted once per session, right after the first `[user, bot]` exchange is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRequest {
    pub session_id: SessionId,
    pub user: String,
    pub bot: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub group_index: usize,
    pub title_request: Option<TitleRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Replied { title_request: Option<TitleRequest> },
    Failed,
    /// The response no longer belongs to the active request or session.
    Discarded,
}

/// Session context driving grouping, persistence, completions and retry.
pub struct ChatPipeline {
    registry: SessionRegistry,
    groups: MessageGroups,
    client: CompletionClient,
    options: PipelineOptions,
    /// Latest input, tagged with the session it was sent in.
    last_user_input: Option<(SessionId, String)>,
    in_flight: Option<RequestTarget>,
    next_request_id: u64,
}

impl ChatPipeline {
    pub fn new(registry: SessionRegistry, client: CompletionClient, options: PipelineOptions) -> Self {
        Self {
            registry,
            groups: MessageGroups::new(),
            client,
            options,
            last_user_input: None,
            in_flight: None,
            next_request_id: 1,
        }
    }

    /// Loads stored sessions, then selects the newest one or creates the first session.
    pub fn bootstrap(&mut self) -> PipelineResult<SessionId> {
        self.registry.load();

        let session_id = match self.registry.sessions().first().map(|session| session.id) {
            Some(session_id) => {
                self.registry
                    .select_session(session_id)
                    .context(RegistrySnafu {
                        stage: "bootstrap-select",
                    })?;
                session_id
            }
            None => self.registry.create_session().context(RegistrySnafu {
                stage: "bootstrap-create",
            })?,
        };

        self.rebuild_groups();

        if let Some(welcome) = self.options.welcome_message.clone()
            && self.transcript().is_empty()
        {
            self.append_message(welcome, Sender::Bot, false, false)?;
        }

        tracing::info!(
            session_id = %session_id,
            session_count = self.registry.sessions().len(),
            "chat pipeline ready"
        );
        Ok(session_id)
    }

    pub fn new_session(&mut self) -> PipelineResult<SessionId> {
        let session_id = self.registry.create_session().context(RegistrySnafu {
            stage: "new-session",
        })?;
        self.rebuild_groups();
        Ok(session_id)
    }

    /// Switches the active transcript. Unknown ids are reported and change nothing.
    pub fn select_session(&mut self, session_id: SessionId) -> PipelineResult<()> {
        if self.registry.current_id() == Some(session_id) {
            return Ok(());
        }

        self.registry
            .select_session(session_id)
            .context(RegistrySnafu {
                stage: "select-session",
            })?;
        self.rebuild_groups();
        Ok(())
    }

    /// Renders a message into its sender group and, when `persist` is set, stores it in
    /// the active transcript.
    pub fn append_message(
        &mut self,
        content: impl Into<String>,
        sender: Sender,
        error: bool,
        persist: bool,
    ) -> PipelineResult<AppendOutcome> {
        let session = self.registry.current().context(NoActiveSessionSnafu {
            stage: "append-message",
        })?;
        let session_id = session.id;
        let transcript_index = persist.then_some(session.conversation.len());

        let message = Message::from_parts(content, sender, error);
        let group_index = self.groups.push(message.clone(), transcript_index);

        if !persist {
            return Ok(AppendOutcome {
                group_index,
                title_request: None,
            });
        }

        self.registry
            .append_message(session_id, message)
            .context(RegistrySnafu {
                stage: "append-message",
            })?;

        let title_request = self.registry.get(session_id).and_then(title_request_for);
        if title_request.is_some() {
            tracing::debug!(session_id = %session_id, "first exchange stored; title requested");
        }

        Ok(AppendOutcome {
            group_index,
            title_request,
        })
    }

    /// Records the user turn and opens a request. Blank input and input arriving while a
    /// request is in flight are ignored.
    pub fn begin_send(&mut self, text: &str) -> PipelineResult<Option<PendingSend>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        if let Some(active) = self.in_flight {
            tracing::debug!(
                request_id = active.request_id,
                "input ignored while a completion is in flight"
            );
            return Ok(None);
        }

        self.append_message(text, Sender::User, false, true)?;
        self.last_user_input = self
            .registry
            .current_id()
            .map(|session_id| (session_id, text.to_string()));
        self.open_request(text).map(Some)
    }

    /// Applies a completion result for `target`.
    pub fn finish_send(
        &mut self,
        target: RequestTarget,
        result: Result<String, CompletionFailure>,
    ) -> PipelineResult<SendOutcome> {
        if self.in_flight != Some(target) {
            tracing::warn!(
                session_id = %target.session_id,
                request_id = target.request_id,
                "discarding response for a request that is no longer in flight"
            );
            return Ok(SendOutcome::Discarded);
        }
        self.in_flight = None;

        if self.registry.current_id() != Some(target.session_id) {
            tracing::warn!(
                session_id = %target.session_id,
                request_id = target.request_id,
                "discarding response for a session that is no longer active"
            );
            return Ok(SendOutcome::Discarded);
        }

        match result {
            Ok(reply) => {
                let outcome = self.append_message(reply, Sender::Bot, false, true)?;
                Ok(SendOutcome::Replied {
                    title_request: outcome.title_request,
                })
            }
            Err(failure) => {
                tracing::error!(
                    session_id = %target.session_id,
                    error = %failure,
                    "completion failed"
                );
                self.append_message(failure_message(&failure), Sender::Bot, true, true)?;
                Ok(SendOutcome::Failed)
            }
        }
    }

    /// Sends `text` and waits for the reply. Returns `None` when the input was ignored.
    pub async fn send(&mut self, text: &str) -> PipelineResult<Option<SendOutcome>> {
        let Some(pending) = self.begin_send(text)? else {
            return Ok(None);
        };
        self.complete(pending).await.map(Some)
    }

    /// Requests the completion for `pending` and applies it.
    pub async fn complete(&mut self, pending: PendingSend) -> PipelineResult<SendOutcome> {
        let result = self
            .client
            .complete(&pending.context, &self.options.system_prompt)
            .await;
        self.finish_send(pending.target, result)
    }

    /// Removes a trailing error group and re-sends the captured user input.
    ///
    /// The failed record is dropped from the transcript as well and the user turn that
    /// produced it is reused, so a successful retry leaves `[.., user, bot]` behind.
    pub fn begin_retry(&mut self) -> PipelineResult<Option<PendingSend>> {
        if self.in_flight.is_some() || !self.can_retry() {
            return Ok(None);
        }

        let session_id = self.registry.current_id().context(NoActiveSessionSnafu {
            stage: "retry",
        })?;
        let Some(text) = self.retry_input() else {
            return Ok(None);
        };

        self.groups.remove_last();
        self.registry
            .remove_last_error(session_id)
            .context(RegistrySnafu {
                stage: "retry-remove-error",
            })?;

        let user_turn_recorded = self
            .transcript()
            .last()
            .is_some_and(|message| message.sender == Sender::User && message.content == text);
        if !user_turn_recorded {
            self.append_message(text.clone(), Sender::User, false, true)?;
        }

        tracing::info!(session_id = %session_id, "retrying last input");
        self.last_user_input = Some((session_id, text.clone()));
        self.open_request(&text).map(Some)
    }

    pub async fn retry(&mut self) -> PipelineResult<Option<SendOutcome>> {
        let Some(pending) = self.begin_retry()? else {
            return Ok(None);
        };
        self.complete(pending).await.map(Some)
    }

    /// Generates a title for `request` and stores it on the originating session.
    ///
    /// Returns true when that session is the one on screen.
    pub async fn resolve_title(&mut self, request: TitleRequest) -> PipelineResult<bool> {
        let title = self
            .client
            .summarize_title(&request.user, &request.bot)
            .await;
        self.apply_title(&request, title)
    }

    pub fn apply_title(&mut self, request: &TitleRequest, title: String) -> PipelineResult<bool> {
        self.registry
            .rename_session(request.session_id, title)
            .context(RegistrySnafu {
                stage: "apply-title",
            })?;
        Ok(self.registry.current_id() == Some(request.session_id))
    }

    pub fn set_model(&mut self, model_id: impl Into<String>) {
        self.client = self.client.clone().with_model(model_id);
    }

    pub fn model_id(&self) -> &str {
        self.client.model_id()
    }

    pub fn can_retry(&self) -> bool {
        self.groups.last().is_some_and(MessageGroup::is_retryable)
    }

    pub fn input_enabled(&self) -> bool {
        self.in_flight.is_none()
    }

    /// Input captured in the active session, if any.
    pub fn last_user_input(&self) -> Option<&str> {
        let current = self.registry.current_id()?;
        self.last_user_input
            .as_ref()
            .filter(|(session_id, _)| *session_id == current)
            .map(|(_, text)| text.as_str())
    }

    pub fn current_title(&self) -> &str {
        self.registry
            .current()
            .map_or(NO_SESSION_TITLE, |session| session.name.as_str())
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.registry.current_id()
    }

    pub fn sessions(&self) -> &[Session] {
        self.registry.sessions()
    }

    pub fn transcript(&self) -> &[Message] {
        self.registry
            .current()
            .map(|session| session.conversation.as_slice())
            .unwrap_or_default()
    }

    pub fn groups(&self) -> &MessageGroups {
        &self.groups
    }

    fn open_request(&mut self, text: &str) -> PipelineResult<PendingSend> {
        let session_id = self.registry.current_id().context(NoActiveSessionSnafu {
            stage: "open-request",
        })?;
        let target = RequestTarget {
            session_id,
            request_id: self.next_request_id,
        };
        self.next_request_id = self.next_request_id.saturating_add(1);
        self.in_flight = Some(target);

        let context = self
            .transcript()
            .iter()
            .filter(|message| !message.error)
            .map(Message::to_provider_message)
            .collect();

        Ok(PendingSend {
            target,
            text: text.to_string(),
            context,
        })
    }

    fn retry_input(&self) -> Option<String> {
        // Input captured in another session or before a restart does not apply; use the
        // user turn that failed here.
        self.last_user_input().map(str::to_string).or_else(|| {
            self.transcript()
                .iter()
                .rev()
                .find(|message| message.sender == Sender::User)
                .map(|message| message.content.clone())
        })
    }

    fn rebuild_groups(&mut self) {
        self.groups = MessageGroups::from_transcript(self.transcript());
    }
}

fn title_request_for(session: &Session) -> Option<TitleRequest> {
    if !session.is_first_exchange() {
        return None;
    }

    Some(TitleRequest {
        session_id: session.id,
        user: session.conversation[0].content.clone(),
        bot: session.conversation[1].content.clone(),
    })
}

fn failure_message(failure: &CompletionFailure) -> &'static str {
    match failure {
        CompletionFailure::Transport { .. } => NETWORK_FAILURE_MESSAGE,
        CompletionFailure::MalformedResponse { .. } | CompletionFailure::EmptyContext => {
            EMPTY_REPLY_MESSAGE
        }
    }
}
