use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings_from, DEFAULT_CONFIG_FILE}, AppFocus, AuthApi, ChatApi, ChatClient, ClientEvent,
    ClientSettings, Command, ConnectionManager, HttpChatApi, NotificationPermission,
    NotificationRequest, Notifier, Session, SessionStore,
};
use shared::{domain::UserId, protocol::ChatMessage};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat_cli", about = "Terminal client for the chat backend")]
struct Cli {
    /// Settings file; defaults to chat_client.toml in the working directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    Login {
        email: String,
        #[arg(long)]
        password: String,
    },
    Register {
        username: String,
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    /// Lists friends with their unread counts.
    Friends,
    /// Opens the realtime session, optionally starting in a conversation.
    Chat {
        /// Friend id or username.
        peer: Option<String>,
    },
}

const HELP: &str = "commands: /open <friend>, /close, /friends, /away, /back, /show, /reconnect, /quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_file = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let settings = load_settings_from(Some(&config_file), |key| std::env::var(key).ok())?;
    let store = SessionStore::new(&settings.session_file);

    match cli.command {
        CliCommand::Login { email, password } => {
            let session = AuthApi::new(&settings.api_url)?
                .login(&email, &password)
                .await
                .context("login failed")?;
            store.save(&session)?;
            println!("signed in as {} ({})", session.user.username, session.user.id);
        }
        CliCommand::Register {
            username,
            email,
            password,
        } => {
            let session = AuthApi::new(&settings.api_url)?
                .register(&username, &email, &password)
                .await
                .context("registration failed")?;
            store.save(&session)?;
            println!("registered and signed in as {}", session.user.username);
        }
        CliCommand::Logout => {
            store.clear()?;
            println!("signed out");
        }
        CliCommand::Friends => {
            let session = require_session(&store)?;
            let api = HttpChatApi::for_session(&settings.api_url, &session)?;
            let friends = match api.get_friends().await {
                Ok(friends) => friends,
                Err(err) if err.is_unauthorized() => {
                    bail!("session expired; run `chat_cli login` again")
                }
                Err(err) => return Err(err.into()),
            };
            for friend in friends {
                println!(
                    "{:<20} {:<26} unread={}",
                    friend.username,
                    friend.id,
                    friend.unread()
                );
            }
        }
        CliCommand::Chat { peer } => {
            let session = require_session(&store)?;
            run_chat(settings, session, peer).await?;
        }
    }

    Ok(())
}

fn require_session(store: &SessionStore) -> Result<Session> {
    store
        .load()?
        .context("not signed in; run `chat_cli login` first")
}

/// Prints notifications to the terminal. A terminal never needs to ask.
struct TerminalNotifier;

#[async_trait]
impl Notifier for TerminalNotifier {
    fn permission(&self) -> NotificationPermission {
        NotificationPermission::Granted
    }

    async fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Granted
    }

    fn show(&self, request: &NotificationRequest) {
        println!("\x07[{}] {} (/show to open)", request.title, request.body);
    }
}

/// Foreground flag toggled with `/away` and `/back`.
struct TerminalFocus {
    foreground: AtomicBool,
}

impl AppFocus for TerminalFocus {
    fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    fn bring_to_foreground(&self) {
        self.foreground.store(true, Ordering::SeqCst);
    }

    fn navigate(&self, route: &str) {
        info!(route, "cli: opening chat view");
    }
}

type LastNotification = Arc<Mutex<Option<NotificationRequest>>>;

async fn run_chat(settings: ClientSettings, session: Session, peer: Option<String>) -> Result<()> {
    let api = Arc::new(HttpChatApi::for_session(&settings.api_url, &session)?);
    let focus = Arc::new(TerminalFocus {
        foreground: AtomicBool::new(true),
    });
    let client = ChatClient::new(
        &settings,
        session.clone(),
        api.clone(),
        ConnectionManager::from_settings(&settings),
        Arc::new(TerminalNotifier),
        focus.clone(),
    );

    let last_notification = LastNotification::default();
    let printer = tokio::spawn(print_events(
        BroadcastStream::new(client.subscribe_events()),
        session.user.id.clone(),
        Arc::clone(&last_notification),
    ));
    let (commands, command_rx) = mpsc::channel(64);
    let runner = tokio::spawn(client.run(command_rx));

    println!("{HELP}");
    if let Some(peer) = peer {
        let peer = resolve_peer(api.as_ref(), &peer).await?;
        commands.send(Command::SelectPeer(peer)).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Open(raw) => match resolve_peer(api.as_ref(), raw).await {
                Ok(peer) => Command::SelectPeer(peer),
                Err(err) => {
                    eprintln!("{err:#}");
                    continue;
                }
            },
            Input::Close => Command::ClearPeer,
            Input::Friends => Command::RefreshFriends,
            Input::Reconnect => Command::Reconnect,
            Input::Away => {
                focus.foreground.store(false, Ordering::SeqCst);
                continue;
            }
            Input::Back => {
                focus.bring_to_foreground();
                continue;
            }
            Input::Show => {
                let last = last_notification
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match last {
                    Some(request) => Command::NotificationClicked(request),
                    None => continue,
                }
            }
            Input::Unknown(word) => {
                eprintln!("unknown command {word}; {HELP}");
                continue;
            }
            Input::Message(text) => Command::Send(text.to_string()),
        };
        commands.send(command).await?;
    }

    // The runner may already have stopped on its own; that is reported below.
    let _ = commands.send(Command::Shutdown).await;
    runner.await.context("client task panicked")??;
    printer.abort();
    Ok(())
}

/// One stdin line. Input is read a whole line at a time, so there is no
/// keystroke signal to drive typing indicators from; messages are sent as is.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Open(&'a str),
    Close,
    Friends,
    Reconnect,
    Away,
    Back,
    Show,
    Unknown(&'a str),
    Message(&'a str),
}

fn parse_line(line: &str) -> Input<'_> {
    let line = line.trim();
    let (word, rest) = line
        .split_once(' ')
        .map_or((line, ""), |(word, rest)| (word, rest.trim()));
    match word {
        "" => Input::Empty,
        "/quit" => Input::Quit,
        "/open" => Input::Open(rest),
        "/close" => Input::Close,
        "/friends" => Input::Friends,
        "/reconnect" => Input::Reconnect,
        "/away" => Input::Away,
        "/back" => Input::Back,
        "/show" => Input::Show,
        other if other.starts_with('/') => Input::Unknown(other),
        _ => Input::Message(line),
    }
}

async fn resolve_peer(api: &dyn ChatApi, raw: &str) -> Result<UserId> {
    if raw.is_empty() {
        bail!("usage: /open <friend id or username>");
    }
    let friends = api.get_friends().await?;
    friends
        .into_iter()
        .find(|friend| friend.id.as_str() == raw || friend.username.eq_ignore_ascii_case(raw))
        .map(|friend| friend.id)
        .with_context(|| format!("'{raw}' is not in your friends list"))
}

async fn print_events(
    mut events: BroadcastStream<ClientEvent>,
    self_id: UserId,
    last_notification: LastNotification,
) {
    let mut current: Option<UserId> = None;
    let mut printed = 0;

    while let Some(event) = events.next().await {
        match event {
            Ok(ClientEvent::MessagesUpdated { peer, messages }) => {
                if peer != current {
                    if let Some(peer) = &peer {
                        println!("--- conversation with {peer} ---");
                    }
                    current = peer;
                    printed = 0;
                }
                // A refetch may return fewer messages than were shown.
                if messages.len() < printed {
                    printed = 0;
                }
                for message in &messages[printed..] {
                    print_message(message, &self_id);
                }
                printed = messages.len();
            }
            Ok(ClientEvent::PeerTyping { peer, typing }) => {
                if typing {
                    println!("{peer} is typing...");
                }
            }
            Ok(ClientEvent::ConnectionChanged(status)) => println!("[{status:?}]"),
            Ok(ClientEvent::FriendsUpdated(friends)) => {
                let unread: Vec<String> = friends
                    .iter()
                    .filter(|friend| friend.unread() > 0)
                    .map(|friend| format!("{} ({})", friend.username, friend.unread()))
                    .collect();
                if !unread.is_empty() {
                    println!("unread: {}", unread.join(", "));
                }
            }
            Ok(ClientEvent::Notification(request)) => {
                *last_notification
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(request);
            }
            Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "cli: display fell behind");
            }
        }
    }
}

fn print_message(message: &ChatMessage, self_id: &UserId) {
    let who = if &message.sender_id == self_id {
        "you".to_string()
    } else {
        message.sender_id.to_string()
    };
    println!(
        "[{}] {who}: {}",
        message.timestamp.format("%H:%M"),
        message.content
    );
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
