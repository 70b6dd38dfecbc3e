use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chatwire::{
    AttachmentId, AttachmentState, ChatSession, ClientMessageId, ClientSettings, Message,
    SessionError, SessionUpdate, SettingsStore,
};
use chatwire_api::{ApiError, ConversationId, HttpBackend, Role, UploadFile};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to build the http backend on `{stage}`: {source}"))]
    Backend { stage: &'static str, source: ApiError },
    #[snafu(display("failed to build the stream connector on `{stage}`: {source}"))]
    Connector { stage: &'static str, source: ApiError },
    #[snafu(display("'{raw}' is not a conversation id"))]
    InvalidConversationId { stage: &'static str, raw: String },
    #[snafu(display("session failed on `{stage}`: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "chatwire exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let store = SettingsStore::load();
    let settings = store.settings();
    tracing::info!(path = %store.config_path().display(), base_url = %settings.base_url, "settings loaded");

    let backend = HttpBackend::new(settings.backend_config()).context(BackendSnafu {
        stage: "build-backend",
    })?;
    let connector = settings.stream_connector().context(ConnectorSnafu {
        stage: "build-connector",
    })?;

    let conversation_id = std::env::args()
        .nth(1)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .ok()
                .map(ConversationId::new)
                .context(InvalidConversationIdSnafu {
                    stage: "parse-arguments",
                    raw,
                })
        })
        .transpose()?;

    let (mut session, mut updates) = ChatSession::new(
        Arc::new(backend),
        Arc::new(connector),
        settings.session_config(),
        conversation_id,
    );

    let printer = tokio::spawn(async move {
        let mut printer = UpdatePrinter::default();
        while let Some(update) = updates.recv().await {
            printer.print(update);
        }
    });

    if conversation_id.is_some() {
        session.load_history().await.context(SessionSnafu {
            stage: "load-history",
        })?;
    }

    let liveness = session.liveness();
    tokio::spawn({
        let liveness = liveness.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                liveness.cancel();
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = liveness.cancelled() => break,
            line = lines.next_line() => line.context(ReadInputSnafu { stage: "read-stdin" })?,
        };
        let Some(line) = line else {
            break;
        };

        session.pump_channel();
        match parse_command(&line) {
            Command::Quit => break,
            Command::Skip => {}
            Command::Attach(path) => attach(&mut session, path).await,
            Command::Detach(id) => {
                if session.remove_attachment(id).is_none() {
                    eprintln!("no attachment {id}");
                }
            }
            Command::Retry(id) => match session.retry_attachment(id).await {
                Ok(Some(_)) => {}
                Ok(None) => eprintln!("no attachment {id}"),
                Err(error) => eprintln!("error: {error}"),
            },
            Command::Set { key, value } => match store.set(key, value) {
                Ok(_) => println!("  [{key} saved; applies from the next start]"),
                Err(error) => eprintln!("error: {error}"),
            },
            Command::Invalid(message) => eprintln!("{message}"),
            Command::Submit(text) => {
                if let Err(error) = session.submit(text).await {
                    eprintln!("error: {error}");
                }
            }
        }
    }

    session.shutdown();
    drop(session);
    let _ = printer.await;
    Ok(())
}

async fn attach(session: &mut ChatSession, path: &str) {
    let file = match UploadFile::from_path(Path::new(path)).await {
        Ok(file) => file,
        Err(error) => {
            eprintln!("error: {error}");
            return;
        }
    };
    if let Err(error) = session.attach_files(vec![file]).await {
        eprintln!("error: {error}");
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Quit,
    Skip,
    Attach(&'a str),
    Detach(AttachmentId),
    Retry(AttachmentId),
    Set { key: &'a str, value: &'a str },
    Invalid(String),
    Submit(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Command::Skip;
    }

    let (head, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
    let rest = rest.trim();
    match head {
        "/quit" => Command::Quit,
        "/attach" if rest.is_empty() => Command::Invalid("usage: /attach <path>".to_string()),
        "/attach" => Command::Attach(rest),
        "/set" => match rest.split_once(' ') {
            Some((key, value)) => Command::Set {
                key,
                value: value.trim(),
            },
            None if !rest.is_empty() => Command::Set { key: rest, value: "" },
            None => Command::Invalid(format!(
                "usage: /set <key> <value>; keys: {}",
                ClientSettings::FIELDS.join(", ")
            )),
        },
        "/detach" | "/retry" => match rest.trim_start_matches('#').parse::<u64>() {
            Ok(raw) if head == "/detach" => Command::Detach(AttachmentId(raw)),
            Ok(raw) => Command::Retry(AttachmentId(raw)),
            Err(_) => Command::Invalid(format!("usage: {head} <attachment number>")),
        },
        _ => Command::Submit(trimmed),
    }
}

/// Renders session updates as plain terminal lines, streaming AI text as it grows.
#[derive(Default)]
struct UpdatePrinter {
    streaming: Option<(ClientMessageId, usize)>,
}

impl UpdatePrinter {
    fn print(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::HistoryLoaded(messages) => {
                for message in &messages {
                    println!("{}> {}", role_label(message.role), message.text);
                }
            }
            SessionUpdate::MessageAppended(message) => self.appended(&message),
            SessionUpdate::MessageUpdated(message) => self.updated(&message),
            SessionUpdate::MessageReplaced { message, .. } => {
                self.finish_line();
                println!("ai> {}", message.text);
            }
            SessionUpdate::Action(action) => {
                self.finish_line();
                println!("  [{action}]");
            }
            SessionUpdate::ChannelDegraded { reason } => {
                self.finish_line();
                println!("  [streaming unavailable, polling instead: {reason}]");
            }
            SessionUpdate::PollFailed {
                error,
                consecutive_failures,
            } => println!("  [status check {consecutive_failures} failed: {error}]"),
            SessionUpdate::SubmissionFailed { error } => {
                self.finish_line();
                eprintln!("  [message failed: {error}]");
            }
            SessionUpdate::AttachmentChanged(attachment) => {
                let state = match &attachment.state {
                    AttachmentState::Uploading => "uploading".to_string(),
                    AttachmentState::Uploaded(file) => format!("ready (file {})", file.id),
                    AttachmentState::UploadError {
                        timed_out: true, ..
                    } => "timed out, /retry to try again".to_string(),
                    AttachmentState::UploadError { reason, .. } => format!("failed: {reason}"),
                };
                println!("  [attachment {} {}: {state}]", attachment.id, attachment.name);
            }
            SessionUpdate::AttachmentRemoved(id) => println!("  [attachment {id} removed]"),
            SessionUpdate::Loading(loading) => tracing::debug!(loading, "loading changed"),
            SessionUpdate::Composing(composing) => tracing::debug!(composing, "composing changed"),
            SessionUpdate::DeliveryPath(path) => tracing::debug!(path = ?path, "delivery path"),
        }
    }

    fn appended(&mut self, message: &Message) {
        match message.role {
            Role::Human => {}
            Role::System => {
                self.finish_line();
                println!("! {}", message.text);
            }
            Role::Ai if message.server_id.is_some() => {
                self.finish_line();
                println!("ai> {}", message.text);
            }
            Role::Ai => {
                self.finish_line();
                print!("ai> {}", message.text);
                let _ = std::io::stdout().flush();
                self.streaming = Some((message.client_id, message.text.len()));
            }
        }
    }

    fn updated(&mut self, message: &Message) {
        let Some((client_id, printed)) = self.streaming else {
            return;
        };
        if client_id != message.client_id {
            return;
        }

        if let Some(delta) = message.text.get(printed..) {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        self.streaming = Some((client_id, message.text.len()));
        if message.server_id.is_some() {
            self.finish_line();
        }
    }

    fn finish_line(&mut self) {
        if self.streaming.take().is_some() {
            println!();
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Human => "you",
        Role::Ai => "ai",
        Role::System => "!",
    }
}
