use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use client::{
    Applied, ChatSession, ClientError, HttpMessageLog, MessageLog, SendOutcome, WsChangeFeed, WsRelayLink,
};
use events::{Chat, ChatKind, Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing user id; pass --user-id or set CHAT_USER_ID")]
    MissingUserId,
    #[error("health check failed: HTTP {0}")]
    Unhealthy(u16),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("chat was not created")]
    CreateFailed,
    #[error("stdin: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "chat-cli", about = "Realtime chat relay CLI")]
struct Cli {
    #[arg(long, env = "CHAT_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "CHAT_USER_ID")]
    user_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Direct,
    Group,
}

impl From<KindArg> for ChatKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Direct => Self::Direct,
            KindArg::Group => Self::Group,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check `/healthz`.
    Ping,
    /// List chats for the user, most recent first.
    Chats,
    /// Create a chat; the user is always a participant.
    CreateChat {
        #[arg(long)]
        name: String,
        #[arg(long, value_enum, default_value = "group")]
        kind: KindArg,
        participants: Vec<String>,
    },
    /// Print the full history of a chat.
    History { chat_id: String },
    /// Open a chat interactively. Lines from stdin are sent; `/reload`
    /// reloads history and `/quit` leaves.
    Chat { chat_id: String },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ping => run_ping(&cli.base_url).await,
        Command::Chats => {
            let mut session = open_session(&cli.base_url, cli.user_id)?;
            for chat in session.list_chats().await {
                print_chat(&chat);
            }
            Ok(())
        }
        Command::CreateChat { name, kind, participants } => {
            let mut session = open_session(&cli.base_url, cli.user_id)?;
            let chat = session
                .create_chat(&name, kind.into(), participants)
                .await
                .ok_or(CliError::CreateFailed)?;
            print_chat(&chat);
            Ok(())
        }
        Command::History { chat_id } => {
            let log = HttpMessageLog::new(&cli.base_url);
            for message in log.load_messages(&chat_id).await? {
                print_message(&message);
            }
            Ok(())
        }
        Command::Chat { chat_id } => {
            let session = open_session(&cli.base_url, cli.user_id)?;
            run_chat(session, &chat_id).await
        }
    }
}

async fn run_ping(base_url: &str) -> Result<(), CliError> {
    let url = format!("{}/healthz", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new().get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::Unhealthy(status.as_u16()));
    }
    println!("ok");
    Ok(())
}

fn open_session(base_url: &str, user_id: Option<String>) -> Result<ChatSession, CliError> {
    let user_id = user_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(CliError::MissingUserId)?;
    let log = Arc::new(HttpMessageLog::new(base_url));
    let relay = Arc::new(WsRelayLink::connect(base_url)?);
    let feed = Arc::new(WsChangeFeed::new(base_url));
    Ok(ChatSession::new(user_id, log, relay, feed))
}

async fn run_chat(mut session: ChatSession, chat_id: &str) -> Result<(), CliError> {
    session.connect().await;
    session.open_chat(chat_id).await;
    for message in session.messages(chat_id) {
        print_message(message);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "/quit" => break,
                    "/reload" => {
                        session.force_reload().await;
                        for message in session.messages(chat_id) {
                            print_message(message);
                        }
                    }
                    content => {
                        let Some(pending) = session.begin_send(chat_id, content).await else { continue };
                        if let Some(local) = session.store().message(chat_id, &pending.id) {
                            print_message(local);
                        }
                        if let SendOutcome::Unconfirmed(message) = session.finish_send(pending).await {
                            eprintln!("! not delivered, kept locally: {}", message.content);
                        }
                    }
                }
            }
            applied = session.process_next() => {
                print_applied(&session, chat_id, &applied);
            }
        }
    }

    session.close_chat().await;
    Ok(())
}

fn print_applied(session: &ChatSession, chat_id: &str, applied: &Applied) {
    match applied {
        Applied::Message { chat_id: from, message_id, outcome: client::MergeOutcome::Inserted } => {
            if from == chat_id {
                if let Some(message) = session.store().message(chat_id, message_id) {
                    print_message(message);
                }
            } else {
                eprintln!("* new message in {from} ({} unread)", session.unread_count(from));
            }
        }
        Applied::Typing { chat_id: from, .. } if from == chat_id => print_typing(session, chat_id),
        Applied::Timers { .. } => print_typing(session, chat_id),
        Applied::Presence { user_id, online } => {
            eprintln!("* {user_id} is {}", if *online { "online" } else { "offline" });
        }
        Applied::SendFailed(failure) => eprintln!("! {} failed: {}", failure.id, failure.error),
        Applied::RelayError(payload) => eprintln!("! {}: {}", payload.code, payload.message),
        Applied::ChannelClosed(channel) => eprintln!("! {channel:?} channel closed; use /reload"),
        _ => {}
    }
}

fn print_typing(session: &ChatSession, chat_id: &str) {
    let typing = session.typing_users(chat_id);
    if !typing.is_empty() {
        eprintln!("* {} typing", typing.join(", "));
    }
}

fn print_chat(chat: &Chat) {
    let participants = chat.participants.iter().cloned().collect::<Vec<_>>().join(",");
    println!("{}\t{}\t{}\t{participants}", chat.id, chat.kind.as_str(), chat.name);
}

fn print_message(message: &Message) {
    let ts = message.timestamp;
    let pending = if message.unconfirmed { " (unconfirmed)" } else { "" };
    println!(
        "[{:02}:{:02}] {}: {}{pending}",
        ts.hour(),
        ts.minute(),
        message.sender_id,
        message.content
    );
}
