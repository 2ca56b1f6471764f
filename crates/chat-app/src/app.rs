use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parley_llm::{CompletionClient, ProviderError, create_provider};
use parley_storage::{FileStore, KeyValueStore, MemoryStore, SqliteStore, StorageError};
use snafu::{ResultExt, Snafu, ensure};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::chat::{
    ChatPipeline, MessageGroups, PendingSend, PipelineError, PipelineOptions, SendOutcome,
    SessionRegistry,
};
use crate::settings::{AppSettings, SettingsStore, StorageBackend};
use crate::theme::{ThemeMode, load_theme, toggle_theme};

pub const SQLITE_FILE_NAME: &str = "parley.db";

const HELP_TEXT: &str = "\
Commands:
  <text>        send a message
  /new          start a new chat
  /list         list chats
  /select <n>   switch to chat number <n>
  /retry        resend the last message after an error
  /model <id>   switch the completion model
  /theme        toggle light/dark preference
  /help         show this help
  /quit         exit";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to open session store on `{stage}`: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display(
        "no API key configured; set `api_key` in {config_path:?}, PARLEY_API_KEY or OPENAI_API_KEY"
    ))]
    MissingCredential {
        stage: &'static str,
        config_path: PathBuf,
    },
    #[snafu(display("failed to create completion provider on `{stage}`: {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("chat pipeline failed on `{stage}`: {source}"))]
    Pipeline {
        stage: &'static str,
        source: PipelineError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    NewSession,
    List,
    /// 1-based position in the session list.
    Select(usize),
    Retry,
    Model(String),
    Theme,
    Help,
    Quit,
    Invalid(String),
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };

    let (name, argument) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(name, argument)| (name, argument.trim()));

    match (name, argument) {
        ("new", "") => Command::NewSession,
        ("list", "") => Command::List,
        ("select", position) => match position.parse::<usize>() {
            Ok(position) if position > 0 => Command::Select(position),
            _ => Command::Invalid("usage: /select <n>".to_string()),
        },
        ("retry", "") => Command::Retry,
        ("model", "") => Command::Invalid("usage: /model <id>".to_string()),
        ("model", model) => Command::Model(model.to_string()),
        ("theme", "") => Command::Theme,
        ("help", "") => Command::Help,
        ("quit" | "exit", "") => Command::Quit,
        _ => Command::Invalid(format!("unknown command `/{name}`; try /help")),
    }
}

/// Opens the configured session store.
pub fn open_store(settings: &AppSettings, ephemeral: bool) -> AppResult<Arc<dyn KeyValueStore>> {
    let backend = if ephemeral {
        StorageBackend::Memory
    } else {
        settings.storage
    };

    let store: Arc<dyn KeyValueStore> = match backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => Arc::new(FileStore::new(settings.resolved_data_dir())),
        StorageBackend::Sqlite => {
            let path = settings.resolved_data_dir().join(SQLITE_FILE_NAME);
            Arc::new(
                SqliteStore::open(&path.to_string_lossy()).context(OpenStoreSnafu {
                    stage: "open-sqlite-store",
                })?,
            )
        }
    };

    tracing::info!(backend = ?backend, "session store opened");
    Ok(store)
}

/// Terminal front-end driving a [`ChatPipeline`].
pub struct ChatApp {
    pipeline: ChatPipeline,
    store: Arc<dyn KeyValueStore>,
    settings: SettingsStore,
    theme: ThemeMode,
    cursor: RenderCursor,
}

impl ChatApp {
    /// Wires store, provider and pipeline from settings and restores the last session.
    pub fn build(settings: SettingsStore, ephemeral: bool) -> AppResult<Self> {
        let current = settings.settings();
        ensure!(
            current.has_credential(),
            MissingCredentialSnafu {
                stage: "build-app",
                config_path: settings.config_path().to_path_buf(),
            }
        );

        let store = open_store(&current, ephemeral)?;
        let provider = create_provider(current.to_provider_config()).context(CreateProviderSnafu {
            stage: "build-app",
        })?;
        let client = CompletionClient::new(provider).with_model(current.model.clone());
        let options = PipelineOptions {
            system_prompt: current.system_prompt.clone(),
            welcome_message: current.welcome_message.clone(),
        };

        let mut pipeline = ChatPipeline::new(SessionRegistry::new(store.clone()), client, options);
        pipeline.bootstrap().context(PipelineSnafu {
            stage: "bootstrap",
        })?;

        Ok(Self::new(pipeline, store, settings))
    }

    pub fn new(pipeline: ChatPipeline, store: Arc<dyn KeyValueStore>, settings: SettingsStore) -> Self {
        let theme = load_theme(store.as_ref());
        Self {
            pipeline,
            store,
            settings,
            theme,
            cursor: RenderCursor::default(),
        }
    }

    pub fn pipeline(&self) -> &ChatPipeline {
        &self.pipeline
    }

    pub fn theme(&self) -> ThemeMode {
        self.theme
    }

    /// Reads commands until `/quit` or end of input.
    pub async fn run<R, W>(&mut self, input: R, output: &mut W) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        self.show_session(output)?;
        writeln!(output, "Type /help for commands.").context(WriteOutputSnafu {
            stage: "run-banner",
        })?;

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-command",
        })? {
            let flow = self.handle(parse_command(&line), output).await?;
            output.flush().context(WriteOutputSnafu {
                stage: "flush-output",
            })?;
            if flow == Flow::Quit {
                break;
            }
        }

        tracing::info!("chat session ended");
        Ok(())
    }

    async fn handle<W: Write>(&mut self, command: Command, output: &mut W) -> AppResult<Flow> {
        match command {
            Command::Empty => {}
            Command::Send(text) => {
                let pending = self.pipeline.begin_send(&text);
                self.drive(pending, output).await?;
            }
            Command::Retry => {
                if !self.pipeline.can_retry() {
                    write_line(output, "Nothing to retry.")?;
                    return Ok(Flow::Continue);
                }
                let pending = self.pipeline.begin_retry();
                self.drive(pending, output).await?;
            }
            Command::NewSession => match self.pipeline.new_session() {
                Ok(_) => self.show_session(output)?,
                Err(error) => report(output, "Could not start a new chat", &error)?,
            },
            Command::List => self.list_sessions(output)?,
            Command::Select(position) => {
                let Some(session_id) = self
                    .pipeline
                    .sessions()
                    .get(position - 1)
                    .map(|session| session.id)
                else {
                    write_line(output, &format!("No chat number {position}."))?;
                    return Ok(Flow::Continue);
                };
                match self.pipeline.select_session(session_id) {
                    Ok(()) => self.show_session(output)?,
                    Err(error) => report(output, "Could not switch chats", &error)?,
                }
            }
            Command::Model(model) => self.switch_model(model, output)?,
            Command::Theme => match toggle_theme(self.store.as_ref(), self.theme) {
                Ok(theme) => {
                    self.theme = theme;
                    write_line(output, &format!("Theme set to {theme}."))?;
                }
                Err(error) => report(output, "Could not save theme", &error)?,
            },
            Command::Help => write_line(output, HELP_TEXT)?,
            Command::Invalid(message) => write_line(output, &message)?,
            Command::Quit => return Ok(Flow::Quit),
        }

        Ok(Flow::Continue)
    }

    async fn drive<W: Write>(
        &mut self,
        pending: Result<Option<PendingSend>, PipelineError>,
        output: &mut W,
    ) -> AppResult<()> {
        let pending = match pending {
            Ok(Some(pending)) => pending,
            Ok(None) => return Ok(()),
            Err(error) => return report(output, "Could not record message", &error),
        };

        self.render_new(output)?;
        write_line(output, "  ...")?;
        output.flush().context(WriteOutputSnafu {
            stage: "flush-typing-indicator",
        })?;

        let outcome = match self.pipeline.complete(pending).await {
            Ok(outcome) => outcome,
            Err(error) => return report(output, "Could not save reply", &error),
        };
        self.render_new(output)?;

        if let SendOutcome::Replied {
            title_request: Some(request),
        } = outcome
        {
            match self.pipeline.resolve_title(request).await {
                Ok(true) => {
                    let title = format!("Chat renamed to \"{}\".", self.pipeline.current_title());
                    write_line(output, &title)?;
                }
                Ok(false) => {}
                Err(error) => report(output, "Could not save chat title", &error)?,
            }
        }

        Ok(())
    }

    fn switch_model<W: Write>(&mut self, model: String, output: &mut W) -> AppResult<()> {
        let mut updated = (*self.settings.settings()).clone();
        updated.model = model;
        if let Err(error) = self.settings.update(updated) {
            return report(output, "Could not save settings", &error);
        }

        let model = self.settings.settings().model.clone();
        self.pipeline.set_model(model.clone());
        write_line(output, &format!("Using model {model}."))
    }

    fn list_sessions<W: Write>(&self, output: &mut W) -> AppResult<()> {
        let current = self.pipeline.current_session_id();
        for (index, session) in self.pipeline.sessions().iter().enumerate() {
            let marker = if Some(session.id) == current { '*' } else { ' ' };
            write_line(
                output,
                &format!(
                    "{marker} {position}. {name} ({count} messages)",
                    position = index + 1,
                    name = session.name,
                    count = session.conversation.len()
                ),
            )?;
        }
        Ok(())
    }

    fn show_session<W: Write>(&mut self, output: &mut W) -> AppResult<()> {
        self.cursor = RenderCursor::default();
        write_line(output, &format!("== {} ==", self.pipeline.current_title()))?;
        self.render_new(output)
    }

    fn render_new<W: Write>(&mut self, output: &mut W) -> AppResult<()> {
        self.cursor
            .render(self.pipeline.groups(), output)
            .context(WriteOutputSnafu {
                stage: "render-messages",
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// How much of the group list has already been printed.
#[derive(Debug, Default)]
struct RenderCursor {
    groups: usize,
    entries_in_last: usize,
}

impl RenderCursor {
    fn render<W: Write>(&mut self, groups: &MessageGroups, output: &mut W) -> std::io::Result<()> {
        if groups.len() < self.groups {
            // A retry dropped the error group.
            self.groups = groups.len();
            self.entries_in_last = groups.last().map_or(0, |group| group.entries.len());
        }

        let resume_from = self.groups.saturating_sub(1);
        for (index, group) in groups.groups().iter().enumerate().skip(resume_from) {
            let first_entry = if index + 1 == self.groups {
                self.entries_in_last
            } else {
                0
            };
            if first_entry == 0 {
                writeln!(output, "\n[{}]", group.sender.label())?;
            }

            for entry in &group.entries[first_entry.min(group.entries.len())..] {
                let message = &entry.message;
                if message.error {
                    writeln!(output, "  ! {}", message.content)?;
                    writeln!(output, "  (type /retry to try again)")?;
                } else {
                    for line in message.content.lines() {
                        writeln!(output, "  {line}")?;
                    }
                }
            }
        }

        self.groups = groups.len();
        self.entries_in_last = groups.last().map_or(0, |group| group.entries.len());
        Ok(())
    }
}

fn write_line<W: Write>(output: &mut W, line: &str) -> AppResult<()> {
    writeln!(output, "{line}").context(WriteOutputSnafu {
        stage: "write-line",
    })
}

fn report<W: Write>(
    output: &mut W,
    summary: &str,
    error: &dyn std::error::Error,
) -> AppResult<()> {
    tracing::error!(error = %error, "{summary}");
    write_line(output, &format!("{summary}: {error}"))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use figment::providers::Serialized;
    use parley_llm::{BoxFuture, CompletionRequest, LlmProvider, ProviderResult};
    use parley_storage::{SESSIONS_KEY, THEME_KEY};

    use super::*;
    use crate::chat::{EMPTY_REPLY_MESSAGE, Message};

    struct QueueProvider {
        replies: Mutex<VecDeque<ProviderResult<String>>>,
    }

    impl LlmProvider for QueueProvider {
        fn id(&self) -> &str {
            "queue"
        }

        fn name(&self) -> &str {
            "Queue"
        }

        fn default_model(&self) -> &str {
            "queue-model"
        }

        fn complete<'a>(
            &'a self,
            _request: CompletionRequest,
        ) -> BoxFuture<'a, ProviderResult<String>> {
            let reply = self
                .replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(Err(ProviderError::MissingReply { stage: "queue" }));
            Box::pin(async move { reply })
        }
    }

    fn app_with(replies: Vec<ProviderResult<String>>, dir: &std::path::Path) -> ChatApp {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let provider = Arc::new(QueueProvider {
            replies: Mutex::new(replies.into()),
        });
        let options = PipelineOptions {
            system_prompt: "sys".to_string(),
            welcome_message: None,
        };
        let mut pipeline = ChatPipeline::new(
            SessionRegistry::new(store.clone()),
            CompletionClient::new(provider),
            options,
        );
        pipeline.bootstrap().expect("bootstrap");
        ChatApp::new(pipeline, store, SettingsStore::new(dir.join("settings.json")))
    }

    async fn run_script(app: &mut ChatApp, script: &str) -> String {
        let mut output = Vec::new();
        app.run(script.as_bytes(), &mut output).await.expect("run");
        String::from_utf8(output).expect("utf8")
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("  hello "), Command::Send("hello".to_string()));
        assert_eq!(parse_command("/new"), Command::NewSession);
        assert_eq!(parse_command("/select 3"), Command::Select(3));
        assert!(matches!(parse_command("/select 0"), Command::Invalid(_)));
        assert!(matches!(parse_command("/select two"), Command::Invalid(_)));
        assert_eq!(parse_command("/model gpt-4.1"), Command::Model("gpt-4.1".to_string()));
        assert!(matches!(parse_command("/bogus"), Command::Invalid(_)));
        assert_eq!(parse_command(""), Command::Empty);
        assert_eq!(parse_command("/exit"), Command::Quit);
    }

    #[tokio::test]
    async fn conversation_renders_groups_and_title() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut app = app_with(
            vec![Ok("hi there".to_string()), Ok("Greeting Chat".to_string())],
            dir.path(),
        );

        let output = run_script(&mut app, "hello\n/quit\n").await;

        assert!(output.contains("[You]\n  hello"));
        assert!(output.contains("[Assistant]\n  hi there"));
        assert!(output.contains("Chat renamed to \"Greeting Chat\"."));
        assert_eq!(
            app.pipeline().transcript(),
            &[Message::user("hello"), Message::bot("hi there")]
        );
    }

    #[tokio::test]
    async fn error_shows_retry_hint_and_retry_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut app = app_with(
            vec![
                Err(ProviderError::MissingReply { stage: "queue" }),
                Ok("second try".to_string()),
            ],
            dir.path(),
        );

        let output = run_script(&mut app, "hello\n/retry\n/retry\n").await;

        assert!(output.contains(&format!("  ! {EMPTY_REPLY_MESSAGE}")));
        assert!(output.contains("(type /retry to try again)"));
        assert!(output.contains("second try"));
        assert!(output.contains("Nothing to retry."));
        assert_eq!(app.pipeline().transcript().len(), 2);
    }

    #[tokio::test]
    async fn new_list_and_select_switch_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut app = app_with(vec![Ok("reply".to_string())], dir.path());

        let output = run_script(&mut app, "question\n/new\n/list\n/select 2\n/select 9\n").await;

        assert!(output.contains("* 1. New Chat (0 messages)"));
        assert!(output.contains("No chat number 9."));
        assert_eq!(app.pipeline().sessions().len(), 2);
        assert_eq!(app.pipeline().transcript()[0], Message::user("question"));
    }

    #[tokio::test]
    async fn theme_toggle_is_persisted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut app = app_with(Vec::new(), dir.path());

        let output = run_script(&mut app, "/theme\n").await;

        assert!(output.contains("Theme set to dark."));
        assert_eq!(app.theme(), ThemeMode::Dark);
        assert_eq!(
            app.store.get(THEME_KEY).expect("get").as_deref(),
            Some("dark")
        );
    }

    #[tokio::test]
    async fn model_switch_updates_settings_and_pipeline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut app = app_with(Vec::new(), dir.path());

        let output = run_script(&mut app, "/model gpt-4.1-mini\n").await;

        assert!(output.contains("Using model gpt-4.1-mini."));
        assert_eq!(app.pipeline().model_id(), "gpt-4.1-mini");
        assert!(dir.path().join("settings.json").exists());
    }

    #[test]
    fn ephemeral_runs_use_memory_store() {
        let settings = AppSettings {
            storage: StorageBackend::Sqlite,
            ..AppSettings::default()
        };
        let store = open_store(&settings, true).expect("store");
        assert_eq!(store.get(SESSIONS_KEY).expect("get"), None);
    }

    #[test]
    fn file_backend_uses_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = AppSettings {
            data_dir: Some(dir.path().to_path_buf()),
            ..AppSettings::default()
        };
        let store = open_store(&settings, false).expect("store");
        store.set(SESSIONS_KEY, "[]").expect("set");

        assert!(dir.path().join("ai_chat_sessions.json").exists());
    }

    #[test]
    fn build_requires_a_credential() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"api_key": "", "storage": "memory"}"#).expect("write");
        let settings = SettingsStore::with_overrides(
            path,
            Serialized::defaults(serde_json::Map::new()),
            None,
        );
        assert!(!settings.settings().has_credential());

        let error = ChatApp::build(settings, true).err().expect("must fail");
        assert!(matches!(error, AppError::MissingCredential { .. }));
    }
}
