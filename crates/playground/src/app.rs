use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use playground_llm::{LlmProvider, ProviderConfig, ProviderError, create_provider};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use crate::chat::ExportFormat;
use crate::chat::export::{read_import, write_export};
use crate::session::{ChatSession, RenderFrame, SessionError, StreamDisplay};
use crate::settings::{EDITABLE_FIELDS, SettingsOverrides, SettingsStore};
use crate::stream::CURSOR_GLYPH;

const HELP: &str = "\
Type a message to chat. Commands:
  /help                       show this help
  /history                    list the conversation with message numbers
  /delete <n>                 remove message number n
  /clear                      start a new conversation
  /stats                      message count, characters and model
  /metrics                    timing of the last response
  /config                     show the active settings
  /set <field> <value>        change a setting for this session
  /save                       write the active settings to disk
  /export json|text [path]    save the conversation
  /import <path>              load a conversation exported as JSON
  /quit                       exit
Press Ctrl-C while a response streams to stop it, or at the prompt to exit.";

#[derive(Debug, Parser)]
#[command(name = "playground")]
#[command(about = "Terminal playground for OpenAI-compatible chat endpoints")]
pub struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Model name sent with every request
    #[arg(short, long)]
    pub model: Option<String>,
    /// Endpoint base URL, e.g. http://localhost:11434/v1
    #[arg(long)]
    pub base_url: Option<String>,
    #[arg(long)]
    pub api_token: Option<String>,
    #[arg(long)]
    pub system_prompt: Option<String>,
    #[arg(short, long)]
    pub temperature: Option<f64>,
    #[arg(long)]
    pub max_tokens: Option<u64>,
}

impl Cli {
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            api_token: self.api_token.clone(),
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Prompt(String),
    Help,
    History,
    /// Zero-based index; the command line takes one-based numbers.
    Delete(usize),
    Clear,
    Stats,
    Metrics,
    Config,
    Set { field: String, value: String },
    Save,
    Export {
        format: ExportFormat,
        path: Option<PathBuf>,
    },
    Import(PathBuf),
    Quit,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { stage: &'static str, name: String },
    #[snafu(display("usage: {usage}"))]
    Usage {
        stage: &'static str,
        usage: &'static str,
    },
    #[snafu(display("{source}"))]
    Format {
        stage: &'static str,
        source: crate::chat::ExportError,
    },
}

impl Command {
    /// Parses one input line; blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Ok(Some(Self::Prompt(line.trim_end_matches(['\r', '\n']).to_string())));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        let command = match name.to_ascii_lowercase().as_str() {
            "help" | "?" => Self::Help,
            "history" => Self::History,
            "delete" | "del" => {
                let usage = UsageSnafu {
                    stage: "parse-delete-command",
                    usage: "/delete <n>, where n is a message number from /history",
                };
                match args.parse::<usize>() {
                    Ok(number) if number >= 1 => Self::Delete(number - 1),
                    _ => return usage.fail(),
                }
            }
            "clear" | "new" => Self::Clear,
            "stats" => Self::Stats,
            "metrics" => Self::Metrics,
            "config" => Self::Config,
            "set" => match args.split_once(char::is_whitespace) {
                Some((field, value)) => Self::Set {
                    field: field.to_string(),
                    value: value.trim().to_string(),
                },
                None if !args.is_empty() => Self::Set {
                    field: args.to_string(),
                    value: String::new(),
                },
                None => {
                    return UsageSnafu {
                        stage: "parse-set-command",
                        usage: "/set <field> <value>",
                    }
                    .fail();
                }
            },
            "save" => Self::Save,
            "export" => {
                let mut parts = args.split_whitespace();
                let format = parts.next().unwrap_or("json").parse::<ExportFormat>().context(
                    FormatSnafu {
                        stage: "parse-export-command",
                    },
                )?;
                Self::Export {
                    format,
                    path: parts.next().map(PathBuf::from),
                }
            }
            "import" => {
                if args.is_empty() {
                    return UsageSnafu {
                        stage: "parse-import-command",
                        usage: "/import <path>",
                    }
                    .fail();
                }
                Self::Import(PathBuf::from(args))
            }
            "quit" | "exit" | "q" => Self::Quit,
            other => {
                return UnknownCommandSnafu {
                    stage: "parse-command",
                    name: other.to_string(),
                }
                .fail();
            }
        };

        Ok(Some(command))
    }
}

/// Prints a streaming response in place.
///
/// Only the new suffix of each frame is written. The cursor glyph is erased
/// with a backspace before the next write, and the metrics line follows the
/// final frame.
pub struct TerminalDisplay<W> {
    out: W,
    printed: String,
    cursor_shown: bool,
}

impl<W: Write> TerminalDisplay<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            printed: String::new(),
            cursor_shown: false,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn draw(&mut self, frame: RenderFrame<'_>) -> std::io::Result<()> {
        if self.cursor_shown {
            self.out.write_all("\u{8} \u{8}".as_bytes())?;
            self.cursor_shown = false;
        }

        match frame.text.strip_prefix(self.printed.as_str()) {
            Some(suffix) => {
                self.out.write_all(suffix.as_bytes())?;
                self.printed.push_str(suffix);
            }
            None => {
                // Final text no longer extends what is on screen (an error replaced it).
                writeln!(self.out)?;
                self.out.write_all(frame.text.as_bytes())?;
                self.printed = frame.text.to_string();
            }
        }

        if frame.cursor {
            self.out.write_all(CURSOR_GLYPH.as_bytes())?;
            self.cursor_shown = true;
        } else {
            writeln!(self.out)?;
            writeln!(self.out, "{}", frame.metrics)?;
            self.printed.clear();
        }
        self.out.flush()
    }
}

impl<W: Write> StreamDisplay for TerminalDisplay<W> {
    fn render(&mut self, frame: RenderFrame<'_>) {
        if let Err(error) = self.draw(frame) {
            tracing::warn!(error = %error, "failed to draw streaming frame");
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

enum ProviderSource {
    Settings(Option<(ProviderConfig, Arc<dyn LlmProvider>)>),
    Fixed(Arc<dyn LlmProvider>),
}

/// The interactive loop's state, separated from stdin so it can be driven
/// line by line.
pub struct Repl<W> {
    store: SettingsStore,
    session: ChatSession,
    display: TerminalDisplay<W>,
    provider: ProviderSource,
}

impl<W: Write> Repl<W> {
    pub fn new(store: SettingsStore, session: ChatSession, out: W) -> Self {
        Self {
            store,
            session,
            display: TerminalDisplay::new(out),
            provider: ProviderSource::Settings(None),
        }
    }

    /// Uses `provider` for every prompt instead of building one from settings.
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = ProviderSource::Fixed(provider);
        self
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    pub fn into_writer(self) -> W {
        self.display.into_inner()
    }

    fn say(&mut self, text: impl std::fmt::Display) -> Result<(), AppError> {
        writeln!(self.display.writer(), "{text}").context(WriteOutputSnafu {
            stage: "write-repl-output",
        })
    }

    fn provider(&mut self) -> Result<Option<Arc<dyn LlmProvider>>, ProviderError> {
        let settings = self.store.settings();
        let cache = match &mut self.provider {
            ProviderSource::Fixed(provider) => return Ok(Some(provider.clone())),
            ProviderSource::Settings(cache) => cache,
        };
        let Some(config) = settings.to_provider_config() else {
            return Ok(None);
        };
        if let Some((cached_config, provider)) = cache
            && *cached_config == config
        {
            return Ok(Some(provider.clone()));
        }

        let provider = create_provider(config.clone())?;
        *cache = Some((config, provider.clone()));
        Ok(Some(provider))
    }

    pub async fn handle<C>(&mut self, command: Command, cancel: C) -> Result<Flow, AppError>
    where
        C: Future<Output = ()>,
    {
        match command {
            Command::Prompt(prompt) => self.submit(&prompt, cancel).await?,
            Command::Help => self.say(HELP)?,
            Command::History => {
                if self.session.conversation().is_empty() {
                    self.say("(no messages)")?;
                }
                let lines = self
                    .session
                    .conversation()
                    .messages()
                    .iter()
                    .enumerate()
                    .map(|(index, message)| {
                        format!("[{}] {}: {}", index + 1, message.role.as_str(), message.content)
                    })
                    .collect::<Vec<_>>();
                for line in lines {
                    self.say(line)?;
                }
            }
            Command::Delete(index) => match self.session.delete_message(index) {
                Some(_) => self.say(format_args!("deleted message {}", index + 1))?,
                None => self.say(format_args!("no message {}", index + 1))?,
            },
            Command::Clear => {
                self.session.clear();
                self.say("started a new conversation")?;
            }
            Command::Stats => {
                let stats = self.session.stats();
                let settings = self.store.settings();
                let model = if settings.model.is_empty() {
                    "(none)"
                } else {
                    settings.model.as_str()
                };
                self.say(format_args!(
                    "messages: {} | characters: {} | model: {model}",
                    stats.message_count, stats.total_characters
                ))?;
            }
            Command::Metrics => match self.session.last_metrics().copied() {
                Some(metrics) => self.say(metrics)?,
                None => self.say("no response yet")?,
            },
            Command::Config => {
                let mut settings = (*self.store.settings()).clone();
                if settings.api_token.is_some() {
                    settings.api_token = Some("********".to_string());
                }
                match serde_json::to_string_pretty(&settings) {
                    Ok(json) => self.say(json)?,
                    Err(error) => self.say(format_args!("failed to render settings: {error}"))?,
                }
                let path = self.store.config_path().to_path_buf();
                self.say(format_args!("settings file: {path:?}"))?;
            }
            Command::Set { field, value } => {
                let mut settings = (*self.store.settings()).clone();
                match settings.set_field(&field, &value) {
                    Ok(()) => {
                        self.store.replace(settings);
                        self.say(format_args!("{field} updated (use /save to keep it)"))?;
                    }
                    Err(error) => {
                        self.say(format_args!("{error}"))?;
                        self.say(format_args!("fields: {}", EDITABLE_FIELDS.join(", ")))?;
                    }
                }
            }
            Command::Save => match self.store.save() {
                Ok(()) => {
                    let path = self.store.config_path().to_path_buf();
                    self.say(format_args!("saved to {path:?}"))?;
                }
                Err(error) => self.say(error)?,
            },
            Command::Export { format, path } => {
                let path = path.unwrap_or_else(|| PathBuf::from(format.default_file_name()));
                let messages = self.session.conversation().messages();
                let count = messages.len();
                match write_export(&path, messages, format) {
                    Ok(()) => self.say(format_args!("exported {count} messages to {path:?}"))?,
                    Err(error) => self.say(error)?,
                }
            }
            Command::Import(path) => match read_import(&path) {
                Ok(messages) => {
                    let count = messages.len();
                    self.session.replace_messages(messages);
                    self.say(format_args!("loaded {count} messages from {path:?}"))?;
                }
                Err(error) => self.say(error)?,
            },
            Command::Quit => return Ok(Flow::Quit),
        }

        Ok(Flow::Continue)
    }

    async fn submit<C>(&mut self, prompt: &str, cancel: C) -> Result<(), AppError>
    where
        C: Future<Output = ()>,
    {
        let settings = self.store.settings();
        if !settings.is_configured() {
            return self.say(
                "no endpoint configured: /set base_url <url> or /set use_sample_base_url true",
            );
        }

        let provider = match self.provider() {
            Ok(Some(provider)) => provider,
            Ok(None) => return self.say("no endpoint configured"),
            Err(error) => return self.say(format_args!("❌ {error}")),
        };

        let config = settings.to_request_config();
        let result = self
            .session
            .submit(prompt, &config, provider.as_ref(), &mut self.display, cancel)
            .await;

        match result {
            Ok(outcome) if outcome.is_cancelled() => self.say("(stopped)"),
            Ok(_) => Ok(()),
            Err(SessionError::Validation { source, .. }) => self.say(format_args!("⚠ {source}")),
            Err(error) => self.say(format_args!("❌ {error}")),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Line(String),
    Interrupted,
    Closed,
}

/// Waits for the next input line, or for `interrupt` while the prompt is idle.
async fn next_input<R, I>(lines: &mut Lines<R>, interrupt: I) -> Result<Input, AppError>
where
    R: AsyncBufRead + Unpin,
    I: Future<Output = ()>,
{
    tokio::select! {
        biased;
        line = lines.next_line() => {
            let line = line.context(ReadInputSnafu {
                stage: "read-input-line",
            })?;
            Ok(line.map_or(Input::Closed, Input::Line))
        }
        () = interrupt => Ok(Input::Interrupted),
    }
}

/// Resolves on Ctrl-C; never resolves if the signal cannot be watched.
async fn ctrl_c() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Runs the interactive loop until `/quit`, Ctrl-C at the prompt, or end of input.
pub async fn run(cli: Cli) -> Result<(), AppError> {
    let overrides = cli.overrides();
    let store = match cli.config {
        Some(path) => SettingsStore::new(path, &overrides),
        None => SettingsStore::load(&overrides),
    };
    tracing::info!(config_path = ?store.config_path(), "settings loaded");

    let mut repl = Repl::new(store, ChatSession::new(), std::io::stdout());
    repl.say("LLM playground. /help lists commands.")?;
    if !repl.store().settings().is_configured() {
        repl.say("no endpoint configured yet: /set base_url <url> or /set use_sample_base_url true")?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        {
            let out = repl.display.writer();
            write!(out, "> ")
                .and_then(|()| out.flush())
                .context(WriteOutputSnafu {
                    stage: "write-input-prompt",
                })?;
        }

        let line = match next_input(&mut lines, ctrl_c()).await? {
            Input::Line(line) => line,
            Input::Interrupted => {
                repl.say("")?;
                break;
            }
            Input::Closed => break,
        };

        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(error) => {
                repl.say(error)?;
                continue;
            }
        };

        if repl.handle(command, ctrl_c()).await? == Flow::Quit {
            break;
        }
    }

    Ok(())
}
