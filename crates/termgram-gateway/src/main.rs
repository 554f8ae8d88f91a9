//! termgram — bridge Telegram forum topics to tmux windows running an AI
//! coding agent.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use teloxide::adaptors::throttle::Limits;
use teloxide::requests::RequesterExt;
use tracing::{info, warn};

use termgram_core::TermgramConfig;
use termgram_monitor::SessionMonitor;
use termgram_sessions::SessionStore;
use termgram_telegram::{AppContext, TelegramAdapter};
use termgram_tmux::TmuxManager;

#[derive(Parser)]
#[command(name = "termgram", about = "Telegram ↔ tmux bridge for AI coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot (default).
    Run {
        /// Path to termgram.toml (default: ~/.termgram/termgram.toml).
        #[arg(long)]
        config: Option<String>,
    },
    /// Process a SessionStart hook payload from stdin, or manage the hook.
    Hook {
        /// Install the hook into ~/.claude/settings.json.
        #[arg(long)]
        install: bool,
        /// Remove the hook from ~/.claude/settings.json.
        #[arg(long)]
        uninstall: bool,
        /// Show hook installation status.
        #[arg(long)]
        status: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Hook {
            install,
            uninstall,
            status,
        }) => {
            init_logging("warn");
            std::process::exit(hook_main(install, uninstall, status));
        }
        Some(Command::Run { config }) => run_main(config.as_deref()),
        None => run_main(None),
    }
}

fn init_logging(default: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("termgram={default}").into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// The hook runs inside tmux panes without the bot's environment, so it
/// must not touch the full config (which requires the bot token).
fn hook_data_dir() -> PathBuf {
    match std::env::var("TERMGRAM_DATA_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".termgram")
        }
    }
}

fn hook_main(install: bool, uninstall: bool, status: bool) -> i32 {
    let settings_file = termgram_hooks::install::default_settings_file();
    if install {
        return match termgram_hooks::install_hook(&settings_file) {
            Ok(msg) => {
                println!("{msg}");
                0
            }
            Err(e) => {
                eprintln!("Error installing hook: {e}");
                1
            }
        };
    }
    if uninstall {
        return match termgram_hooks::uninstall_hook(&settings_file) {
            Ok(msg) => {
                println!("{msg}");
                0
            }
            Err(e) => {
                eprintln!("Error uninstalling hook: {e}");
                1
            }
        };
    }
    if status {
        let (installed, msg) = termgram_hooks::hook_status(&settings_file);
        println!("{msg}");
        return if installed { 0 } else { 1 };
    }

    let mut payload = String::new();
    if std::io::stdin().read_to_string(&mut payload).is_err() {
        return 0;
    }
    let map_file = hook_data_dir().join("session_map.json");
    if let Err(e) = termgram_hooks::process_hook_payload(&map_file, &payload) {
        warn!(error = %e, "hook processing failed");
    }
    0
}

fn run_main(config_path: Option<&str>) {
    init_logging("info");

    let config = match TermgramConfig::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("termgram needs a valid config before it can start — see termgram.toml.");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("Failed to start runtime: {e}");
        std::process::exit(1);
    });
    runtime.block_on(run(config));
}

async fn run(config: TermgramConfig) {
    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        eprintln!("Cannot create data dir {}: {e}", config.data_dir().display());
        std::process::exit(1);
    }

    let tmux = TmuxManager::new(
        &config.tmux.session_name,
        &config.tmux.main_window_name,
        &config.agent.command,
    );
    if let Err(e) = tmux.get_or_create_session().await {
        warn!(error = %e, "could not ensure tmux session (is tmux installed?)");
    }

    let store = SessionStore::load(
        &config.state_file(),
        &config.session_map_file(),
        &config.tmux.session_name,
        &config.projects_path(),
    );

    // Startup reconciliation: re-resolve persisted window ids against the
    // live tmux server before anything else reads the store.
    match tmux.list_windows().await {
        Ok(windows) => store.resolve_stale_ids(&windows),
        Err(e) => warn!(error = %e, "skipping stale-id resolution"),
    }

    let raw_bot = teloxide::Bot::new(&config.telegram.bot_token);
    let bot = raw_bot.clone().throttle(Limits::default());

    let ctx = AppContext::new(config.clone(), bot, raw_bot, store.clone(), tmux.clone());
    ctx.queue.start();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(256);

    let monitor = SessionMonitor::new(
        store.clone(),
        tmux,
        Duration::from_secs_f64(config.monitor.poll_interval_secs),
        config.monitor_state_file(),
        events_tx,
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));
    let events_task = tokio::spawn(termgram_telegram::handler::run_monitor_events(
        Arc::clone(&ctx),
        events_rx,
    ));
    let poller_task = tokio::spawn(termgram_telegram::status::status_poll_loop(
        Arc::clone(&ctx),
        shutdown_rx,
    ));
    info!("monitor, poller, and delivery pool running");

    // Blocks until the dispatcher stops (ctrl-c).
    TelegramAdapter::new(Arc::clone(&ctx)).run().await;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    ctx.queue.shutdown();
    events_task.abort();
    poller_task.abort();
    let _ = monitor_task.await;
    store.flush();
    info!("state flushed, bye");
}
