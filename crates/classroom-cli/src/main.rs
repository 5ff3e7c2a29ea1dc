use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use classroom_core::{
    LeaveOutcome, LiveSession, Navigator, Role, SessionConfig, SessionControls, SessionError,
    SessionEvent, SessionEventListener, SessionOptions, SessionSnapshot, SettingsStore,
    TokenService,
};
use classroom_livekit::{DevCredentials, LiveKitDevices, LiveKitTransport};

const ENV_API_KEY: &str = "LIVEKIT_API_KEY";
const ENV_API_SECRET: &str = "LIVEKIT_API_SECRET";

/// Join a live classroom session from the terminal.
#[derive(Parser, Debug)]
#[command(name = "classroom", version)]
struct Args {
    /// Channel to join.
    channel: String,

    /// `host` or `audience`.
    #[arg(long, default_value = "audience", value_parser = parse_role)]
    role: Role,

    /// Refuse promotion/demotion for this session.
    #[arg(long)]
    lock_role: bool,

    /// JSON session config; environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    uid: Option<String>,

    /// Name shown to other participants; defaults to the saved one.
    #[arg(long)]
    name: Option<String>,

    /// Where preferences are stored.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn parse_role(value: &str) -> Result<Role, String> {
    Role::parse(value).ok_or_else(|| format!("unknown role '{value}'"))
}

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                    "classroom_core=debug,classroom_livekit=info,classroom_cli=info"
                        .parse()
                        .expect("default filter is valid")
                }),
            )
            .with_ansi(false)
            .init();
    });
}

struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, path: &str) {
        tracing::info!("navigate to {path}");
    }
}

struct LogListener;

impl SessionEventListener for LogListener {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::DeviceFailed { source, error } => {
                tracing::warn!("{} unavailable: {error}", source.label())
            }
            SessionEvent::PublishFailed { message } => tracing::error!("publish failed: {message}"),
            SessionEvent::JoinFailed(message) => tracing::error!("join failed: {message}"),
            other => tracing::debug!("event: {other:?}"),
        }
    }
}

/// One line typed on stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleCommand {
    Mic,
    Camera,
    Screen,
    Hand,
    Promote,
    Demote,
    Status,
    Leave,
}

impl ConsoleCommand {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "mic" | "m" => Some(Self::Mic),
            "cam" | "camera" | "c" => Some(Self::Camera),
            "screen" | "s" => Some(Self::Screen),
            "hand" | "h" => Some(Self::Hand),
            "promote" => Some(Self::Promote),
            "demote" => Some(Self::Demote),
            "status" | "?" => Some(Self::Status),
            "leave" | "quit" | "q" => Some(Self::Leave),
            _ => None,
        }
    }
}

fn summarize(s: &SessionSnapshot) -> String {
    format!(
        "{:?} connection={:?} role={} mic={} cam={} published={} screen={:?} tiles={} audience={}",
        s.state,
        s.connection,
        s.role,
        s.mic_enabled,
        s.camera_enabled,
        s.tracks_published,
        s.screen_share,
        s.roster.tiles().len(),
        s.roster.audience_count,
    )
}

async fn execute(controls: &SessionControls, cmd: ConsoleCommand) -> Result<(), SessionError> {
    match cmd {
        ConsoleCommand::Mic => {
            let on = controls.toggle_microphone().await?;
            tracing::info!("microphone {}", if on { "on" } else { "off" });
        }
        ConsoleCommand::Camera => {
            let on = controls.toggle_camera().await?;
            tracing::info!("camera {}", if on { "on" } else { "off" });
        }
        ConsoleCommand::Screen => {
            let state = controls.toggle_screen_share().await?;
            tracing::info!("screen share {state:?}");
        }
        ConsoleCommand::Hand => {
            if controls.snapshot().hand_raised {
                controls.lower_hand().await?;
            } else {
                let position = controls.raise_hand().await?;
                tracing::info!("hand raised (#{position})");
            }
        }
        ConsoleCommand::Promote => {
            controls.promote_to_host().await?;
        }
        ConsoleCommand::Demote => {
            controls.demote_to_audience().await?;
        }
        ConsoleCommand::Status => tracing::info!("{}", summarize(&controls.snapshot())),
        ConsoleCommand::Leave => {}
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), SessionError> {
    let config = SessionConfig::load(args.config.as_deref())?;
    let data_dir = args
        .data_dir
        .or_else(|| dirs::config_dir().map(|d| d.join("classroom")))
        .unwrap_or_else(|| PathBuf::from("."));
    let settings = SettingsStore::new(data_dir).get();

    let mut options = SessionOptions::new(&args.channel, args.role);
    if args.lock_role {
        options = options.locked();
    }
    if let Some(uid) = &args.uid {
        options = options.with_uid(uid);
    }
    if let Some(name) = &args.name {
        options = options.with_display_name(name);
    }

    let mut server_url = config.server_url.clone();
    if let Some(endpoint) = &config.token_endpoint {
        let info = TokenService::request_token(endpoint, &args.channel, args.uid.as_deref()).await?;
        options = options.with_token(info.token);
        if let Some(uid) = info.uid {
            options = options.with_uid(uid);
        }
        if info.server_url.is_some() {
            server_url = info.server_url;
        }
    }
    let server_url =
        server_url.ok_or_else(|| SessionError::Config("server_url is not set".into()))?;

    let mut transport = LiveKitTransport::new(server_url);
    if let (Ok(key), Ok(secret)) = (std::env::var(ENV_API_KEY), std::env::var(ENV_API_SECRET)) {
        tracing::info!("minting join tokens locally with key {key}");
        transport = transport.with_dev_credentials(DevCredentials::new(key, secret));
    }

    let session = LiveSession::mount(
        Arc::new(transport),
        Arc::new(LiveKitDevices::new()),
        Arc::new(LogNavigator),
        &config,
        &settings,
        options,
    )?;
    let _subscription = session.subscribe(Arc::new(LogListener));
    let controls = session.controls();
    let mut snapshots = session.watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tracing::info!("commands: mic, cam, screen, hand, promote, demote, status, leave");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                tracing::info!("{}", summarize(&snapshots.borrow_and_update()));
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match ConsoleCommand::parse(&line) {
                    Some(ConsoleCommand::Leave) => break,
                    Some(cmd) => {
                        if let Err(e) = execute(&controls, cmd).await {
                            tracing::warn!("{cmd:?}: {e}");
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => tracing::warn!("unknown command '{}'", line.trim()),
                },
                Ok(None) | Err(_) => break,
            },
        }
    }

    if let LeaveOutcome::Left { warnings } = controls.leave().await {
        if !warnings.is_empty() {
            tracing::warn!("left with {} cleanup warnings", warnings.len());
        }
    }
    session.closed().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
