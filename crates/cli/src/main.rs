use anyhow::Context;
use clap::{Parser, Subcommand};
use pyro::bridge::{BridgeError, BridgeEvent, ChatBridge, SendRequest};
use pyro::error::ErrorKind;
use pyro::llm::{GeminiBackend, ImagePayload};
use pyro::settings::{self, Settings, SettingsStore, SettingsUpdate};
use pyro::transcript::{AutoSaveTimer, Speaker, Transcript};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "pyro")]
#[command(about = "Pyro CLI — chat with Gemini from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the settings directory and a default settings file.
    Init {
        /// Settings file path (default: PYRO_SETTINGS_PATH or ~/.pyro/settings.json)
        #[arg(long, short, value_name = "PATH")]
        settings: Option<PathBuf>,
    },

    /// Show or change persisted settings.
    Settings {
        /// Settings file path (default: PYRO_SETTINGS_PATH or ~/.pyro/settings.json)
        #[arg(long, short, value_name = "PATH", global = true)]
        settings: Option<PathBuf>,

        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Chat with Gemini. With MESSAGE, send it once and print the reply; without, start an interactive session.
    Chat {
        /// Settings file path (default: PYRO_SETTINGS_PATH or ~/.pyro/settings.json)
        #[arg(long, short, value_name = "PATH")]
        settings: Option<PathBuf>,

        /// Image to attach to MESSAGE (one-shot mode) or to the first message (interactive).
        #[arg(long, short, value_name = "PATH")]
        image: Option<PathBuf>,

        /// Write the transcript to this file when the chat ends.
        #[arg(long, value_name = "PATH")]
        save: Option<PathBuf>,

        /// Message to send (omit for interactive mode).
        message: Option<String>,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print current settings as JSON (API key masked).
    Show,
    /// Print the settings file path.
    Path,
    /// Update one or more settings and save.
    Set {
        #[arg(long, value_name = "KEY")]
        api_key: Option<String>,
        /// "light" or "dark"
        #[arg(long)]
        theme: Option<String>,
        #[arg(long)]
        font_size: Option<u32>,
        #[arg(long)]
        font_family: Option<String>,
        #[arg(long)]
        auto_save: Option<bool>,
        /// Minutes between auto-saves
        #[arg(long, value_name = "MINUTES")]
        auto_save_interval: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("pyro {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { settings }) => {
            if let Err(e) = run_init(settings) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Settings { settings, action }) => {
            if let Err(e) = run_settings(settings, action) {
                log::error!("settings failed: {:#}", e);
                eprintln!("error: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            settings,
            image,
            save,
            message,
        }) => {
            if let Err(e) = run_chat(settings, image, save, message).await {
                log::error!("chat failed: {:#}", e);
                eprintln!("error: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn store_for(path: Option<PathBuf>) -> SettingsStore {
    path.map(SettingsStore::new)
        .unwrap_or_else(SettingsStore::at_default_path)
}

fn run_init(settings_path: Option<PathBuf>) -> anyhow::Result<()> {
    let store = store_for(settings_path);
    let dir = pyro::init::init_settings_file(store.path())?;
    println!("initialized settings at {}", dir.display());
    Ok(())
}

fn run_settings(settings_path: Option<PathBuf>, action: SettingsAction) -> anyhow::Result<()> {
    let store = store_for(settings_path);
    match action {
        SettingsAction::Path => {
            println!("{}", store.path().display());
        }
        SettingsAction::Show => {
            let current = store.load()?;
            let mut value = serde_json::to_value(&current)?;
            value["apiKey"] = serde_json::Value::String(mask_key(&current.api_key));
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        SettingsAction::Set {
            api_key,
            theme,
            font_size,
            font_family,
            auto_save,
            auto_save_interval,
        } => {
            let mut current = store.load()?;
            let update = SettingsUpdate {
                api_key,
                theme,
                font_size,
                font_family,
                auto_save,
                auto_save_interval,
            };
            store
                .commit(&mut current, &update)
                .with_context(|| format!("updating {}", store.path().display()))?;
            println!("saved {}", store.path().display());
        }
    }
    Ok(())
}

/// Show only enough of the key to recognize it.
fn mask_key(key: &str) -> String {
    if !settings::is_usable_api_key(key) {
        return key.to_string();
    }
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{}", tail)
}

async fn run_chat(
    settings_path: Option<PathBuf>,
    image: Option<PathBuf>,
    save: Option<PathBuf>,
    message: Option<String>,
) -> anyhow::Result<()> {
    let store = store_for(settings_path);
    let settings = store
        .load()
        .with_context(|| format!("loading settings from {}", store.path().display()))?;
    let bridge = ChatBridge::new(
        Arc::new(GeminiBackend::from_env()),
        tokio::runtime::Handle::current(),
    );
    let image = image.as_deref().map(load_image).transpose()?;
    let mut transcript = Transcript::new();

    let result = match message {
        Some(text) => {
            let request = build_request(text, image, &settings);
            send_and_render(&bridge, &mut transcript, request)
                .await
                .map_err(explain)
        }
        None => run_repl(&bridge, &mut transcript, &settings, image).await,
    };

    if let Some(path) = save {
        transcript
            .save_to(&path)
            .with_context(|| format!("saving transcript to {}", path.display()))?;
        eprintln!("transcript saved to {}", path.display());
    }
    result
}

fn load_image(path: &Path) -> anyhow::Result<ImagePayload> {
    ImagePayload::from_path(path).with_context(|| format!("reading image {}", path.display()))
}

fn build_request(message: String, image: Option<ImagePayload>, settings: &Settings) -> SendRequest {
    let request = SendRequest::new(message, settings::resolve_api_key(settings));
    match image {
        Some(img) => request.with_image(img),
        None => request,
    }
}

fn explain(e: BridgeError) -> anyhow::Error {
    match e.kind() {
        ErrorKind::InvalidKey => anyhow::anyhow!(
            "{}. Run `pyro settings set --api-key <KEY>` or set GEMINI_API_KEY.",
            e
        ),
        _ => anyhow::Error::new(e),
    }
}

/// Send one message, drawing a dot per streamed fragment on stderr and the reply on stdout.
async fn send_and_render(
    bridge: &ChatBridge,
    transcript: &mut Transcript,
    request: SendRequest,
) -> Result<(), BridgeError> {
    transcript.push(Speaker::User, request.message.clone());
    let mut handle = bridge.send(request);
    let mut stderr = std::io::stderr();
    while let Some(ev) = handle.recv().await {
        match ev {
            BridgeEvent::Progress(_) => {
                eprint!(".");
                let _ = stderr.flush();
            }
            BridgeEvent::Completion(text) => {
                eprintln!();
                println!("< {}", text.trim());
                transcript.push(Speaker::Assistant, text);
                return Ok(());
            }
            BridgeEvent::Failure(e) => {
                eprintln!();
                return Err(e);
            }
        }
    }
    Err(BridgeError::Transport(
        "chat task ended without a result".to_string(),
    ))
}

/// Read stdin lines on a plain thread so the REPL can wait on input and the auto-save
/// deadline at once.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        loop {
            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Ok(line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });
    rx
}

/// Sleep for `wait`, or forever when auto-save is off.
async fn auto_save_deadline(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Write an auto-save file into `dir` if the timer is due. Returns true when a save was attempted.
fn auto_save_if_due(
    timer: &mut Option<AutoSaveTimer>,
    transcript: &Transcript,
    dir: &Path,
    now: Instant,
) -> bool {
    let Some(timer) = timer.as_mut() else {
        return false;
    };
    if !timer.due(now) {
        return false;
    }
    timer.mark(now);
    match transcript.auto_save(dir, chrono::Local::now()) {
        Ok(path) => eprintln!("chat auto-saved to {}", path.display()),
        Err(e) => eprintln!("failed to auto-save chat: {}", e),
    }
    true
}

async fn run_repl(
    bridge: &ChatBridge,
    transcript: &mut Transcript,
    settings: &Settings,
    mut pending_image: Option<ImagePayload>,
) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    let mut lines = spawn_stdin_reader();
    let mut auto_save = AutoSaveTimer::from_settings(settings, Instant::now());
    if !settings::is_usable_api_key(&settings::resolve_api_key(settings)) {
        eprintln!("warning: API key not set; run `pyro settings set --api-key <KEY>` or set GEMINI_API_KEY");
    }
    println!("commands: /clear, /image PATH, /save PATH, quit");

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let line = loop {
            let wait = auto_save.as_ref().map(|t| t.remaining(Instant::now()));
            tokio::select! {
                line = lines.recv() => break line,
                _ = auto_save_deadline(wait) => {
                    if auto_save_if_due(&mut auto_save, transcript, Path::new("."), Instant::now()) {
                        write!(stdout, "> ")?;
                        stdout.flush()?;
                    }
                }
            }
        };
        let line = match line {
            Some(line) => line?,
            None => break,
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if ["quit", "exit", "/quit", "/exit"]
            .iter()
            .any(|c| input.eq_ignore_ascii_case(c))
        {
            break;
        }
        if input.eq_ignore_ascii_case("/clear") {
            match bridge.reset() {
                Ok(()) => {
                    transcript.clear();
                    println!("conversation cleared");
                }
                Err(e) => eprintln!("cannot clear: {}", e),
            }
            continue;
        }
        if let Some(path) = input.strip_prefix("/save ") {
            let path = Path::new(path.trim());
            match transcript.save_to(path) {
                Ok(()) => println!("saved to {}", path.display()),
                Err(e) => eprintln!("failed to save chat: {}", e),
            }
            continue;
        }
        if let Some(path) = input.strip_prefix("/image ") {
            match load_image(Path::new(path.trim())) {
                Ok(img) => {
                    println!("attached {} ({} bytes) to the next message", img.mime_type, img.bytes.len());
                    pending_image = Some(img);
                }
                Err(e) => eprintln!("{:#}", e),
            }
            continue;
        }

        let request = build_request(input.to_string(), pending_image.take(), settings);
        if let Err(e) = send_and_render(bridge, transcript, request).await {
            eprintln!("chat error: {:#}", explain(e));
        }
        auto_save_if_due(&mut auto_save, transcript, Path::new("."), Instant::now());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_keeps_last_four_characters() {
        assert_eq!(mask_key("AIzaSyExample1234"), "****1234");
        assert_eq!(mask_key(settings::API_KEY_PLACEHOLDER), settings::API_KEY_PLACEHOLDER);
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn cli_parses_settings_set() {
        let cli = Cli::try_parse_from([
            "pyro",
            "settings",
            "set",
            "--theme",
            "light",
            "--auto-save",
            "true",
            "--auto-save-interval",
            "3",
        ])
        .expect("parse");
        match cli.command {
            Some(Commands::Settings {
                action:
                    SettingsAction::Set {
                        theme,
                        auto_save,
                        auto_save_interval,
                        ..
                    },
                ..
            }) => {
                assert_eq!(theme.as_deref(), Some("light"));
                assert_eq!(auto_save, Some(true));
                assert_eq!(auto_save_interval, Some(3));
            }
            _ => panic!("expected settings set"),
        }
    }

    #[test]
    fn auto_save_runs_only_when_due() {
        let dir = std::env::temp_dir().join(format!("pyro-cli-autosave-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let start = Instant::now();
        let mut timer = Some(AutoSaveTimer::new(Duration::from_secs(60), start));
        let mut transcript = Transcript::new();
        transcript.push(Speaker::User, "hello");

        assert!(!auto_save_if_due(&mut timer, &transcript, &dir, start + Duration::from_secs(30)));
        assert!(auto_save_if_due(&mut timer, &transcript, &dir, start + Duration::from_secs(60)));
        assert!(!auto_save_if_due(&mut timer, &transcript, &dir, start + Duration::from_secs(61)));
        assert!(!auto_save_if_due(&mut None, &transcript, &dir, start));

        let saved: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("chat_auto_save_"))
            .collect();
        assert_eq!(saved.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn idle_deadline_fires_without_input() {
        let fired = tokio::time::timeout(
            Duration::from_secs(1),
            auto_save_deadline(Some(Duration::from_millis(10))),
        )
        .await;
        assert!(fired.is_ok());
        let never = tokio::time::timeout(Duration::from_millis(20), auto_save_deadline(None)).await;
        assert!(never.is_err());
    }

    #[test]
    fn invalid_key_error_points_at_settings() {
        let msg = format!("{:#}", explain(BridgeError::InvalidKey));
        assert!(msg.starts_with("API key not set"));
        assert!(msg.contains("GEMINI_API_KEY"));
    }
}
