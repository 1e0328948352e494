use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use stranger_client_core::api::ServerApi;
use stranger_client_core::config::{ChatMode, Config, TransportKind};
use stranger_client_core::media::SyntheticCapture;
use stranger_client_core::negotiation::rtc::RtcPeerFactory;
use stranger_client_core::session::{self, SessionConfig, SessionDeps, SessionEvent, TranscriptEntry};
use stranger_client_core::store::{
    FileStore, MemoryStore, ScratchStore, load_interests, parse_interests, save_interests,
};
use stranger_client_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use stranger_client_core::transport::Connector;
use stranger_client_core::transport::rest::RestConnector;
use stranger_client_core::transport::websocket::WebSocketConnector;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = Config::from_env()?;
    if let Some(server) = cli.server.as_deref() {
        config = config.with_server(server);
    }

    match cli.command.unwrap_or_default() {
        Command::Chat(args) => chat(config, args).await,
        Command::Online => {
            let count = probe_api(&config)?.online().await?;
            println!("{count}");
            Ok(())
        }
        Command::Health => {
            let health = probe_api(&config)?.health().await?;
            println!("{}", health.status);
            if !health.is_ok() {
                bail!("server reported status {:?}", health.status);
            }
            Ok(())
        }
    }
}

fn probe_api(config: &Config) -> Result<ServerApi> {
    let api = ServerApi::new(&config.server)?;
    debug!(base = %api.base(), "using server api");
    Ok(api)
}

#[derive(Parser, Debug)]
#[command(
    name = "stranger",
    about = "Talk to a random stranger over text or video",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "HOST[:PORT]",
        help = "Matchmaking server (overrides STRANGER_SERVER)"
    )]
    server: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "STRANGER_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "STRANGER_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join the chat (default when no subcommand given)
    Chat(ChatArgs),
    /// Print how many people are connected
    Online,
    /// Check that the server is up
    Health,
}

impl Default for Command {
    fn default() -> Self {
        Command::Chat(ChatArgs::default())
    }
}

#[derive(Args, Debug, Default)]
struct ChatArgs {
    #[arg(long, value_enum, help = "Chat mode (overrides STRANGER_MODE)")]
    mode: Option<ChatMode>,

    #[arg(long, value_enum, help = "Channel transport (overrides STRANGER_TRANSPORT)")]
    transport: Option<TransportKind>,

    #[arg(
        long,
        value_name = "LIST",
        help = "Comma separated interests; defaults to the saved list"
    )]
    interests: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Message(String),
    Next,
    Interests(Vec<String>),
    Start,
    Video,
    Audio,
    Quit,
    Help,
}

fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .unwrap_or((command, ""));
    match name {
        "next" => Input::Next,
        "interests" => Input::Interests(parse_interests(rest)),
        "start" => Input::Start,
        "video" => Input::Video,
        "audio" => Input::Audio,
        "quit" | "exit" => Input::Quit,
        _ => Input::Help,
    }
}

const HELP: &str = "commands: /next  /interests a,b  /start  /video  /audio  /quit";

async fn chat(mut config: Config, args: ChatArgs) -> Result<()> {
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(transport) = args.transport {
        config.transport = transport;
    }

    let store: Arc<dyn ScratchStore> = match FileStore::default_location() {
        Ok(store) => {
            debug!(path = %store.path().display(), "interest store");
            Arc::new(store)
        }
        Err(err) => {
            warn!(error = %err, "interest list will not be saved");
            Arc::new(MemoryStore::default())
        }
    };
    let mut interests = initial_interests(store.as_ref(), args.interests.as_deref());

    let connector: Arc<dyn Connector> = match config.transport {
        TransportKind::Websocket => Arc::new(WebSocketConnector::new(config.server.clone())),
        TransportKind::Rest => Arc::new(RestConnector::new(
            config.server.clone(),
            config.poll_interval,
        )),
    };
    let deps = SessionDeps {
        connector,
        peers: Arc::new(RtcPeerFactory::new(config.ice_servers.clone())),
        capture: Arc::new(SyntheticCapture),
        store,
    };
    let (handle, mut events) = session::spawn(SessionConfig::from(&config), deps);

    eprintln!("{HELP}");
    handle.start(interests.clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stdout = io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line.context("failed to read stdin")? else {
                    stdin_open = false;
                    let _ = handle.leave();
                    continue;
                };
                match parse_input(&line) {
                    Input::Message(text) => handle.send_message(text)?,
                    Input::Next => handle.request_new_partner()?,
                    Input::Interests(list) => {
                        interests = list;
                        handle.update_interests(interests.clone())?;
                    }
                    Input::Start => handle.start(interests.clone())?,
                    Input::Video => handle.toggle_video()?,
                    Input::Audio => handle.toggle_audio()?,
                    Input::Quit => {
                        stdin_open = false;
                        handle.leave()?;
                    }
                    Input::Help => eprintln!("{HELP}"),
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if let Some(line) = render(&event) {
                    writeln!(stdout, "{line}")?;
                    stdout.flush()?;
                }
            }
        }
    }

    Ok(())
}

/// Interests given on the command line replace the saved list; otherwise
/// the saved list is used.
fn initial_interests(store: &dyn ScratchStore, flag: Option<&str>) -> Vec<String> {
    match flag {
        Some(raw) => {
            let interests = parse_interests(raw);
            if let Err(err) = save_interests(store, &interests) {
                warn!(error = %err, "failed to save interests");
            }
            interests
        }
        None => load_interests(store).unwrap_or_else(|err| {
            warn!(error = %err, "failed to read saved interests");
            Vec::new()
        }),
    }
}

fn render(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::Transcript(TranscriptEntry::Sent(text)) => Some(format!("You: {text}")),
        SessionEvent::Transcript(TranscriptEntry::Received(text)) => {
            Some(format!("Stranger: {text}"))
        }
        SessionEvent::Transcript(TranscriptEntry::Notice(text)) => Some(format!("* {text}")),
        SessionEvent::PartnerTyping(true) => Some("* Stranger is typing...".to_string()),
        SessionEvent::RemoteStatus(status) => Some(format!("[remote] {status}")),
        SessionEvent::RemoteTrack(track) => Some(format!("[remote] receiving {} track", track.kind)),
        SessionEvent::LocalMedia { video, audio } => Some(format!(
            "[local] video {}, audio {}",
            on_off(*video),
            on_off(*audio)
        )),
        SessionEvent::Online(count) => Some(format!("* Users online: {count}")),
        SessionEvent::State(state) => {
            debug!(?state, "session state");
            None
        }
        SessionEvent::Negotiation(state) => {
            debug!(?state, "negotiation state");
            None
        }
        SessionEvent::PartnerTyping(false) | SessionEvent::RemoteMediaCleared => None,
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}
