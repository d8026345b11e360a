//! Sentinel - test-watch event aggregation core.
//!
//! This binary wires a file watcher to the event dispatcher and talks to an
//! external test runner over stdio.
//!
//! # Commands
//!
//! - `sentinel watch`: Watch a source tree, read runner events from stdin,
//!   write run requests to stdout
//! - `sentinel replay`: Rebuild the tree from a recorded event log and print it
//!
//! # Environment Variables
//!
//! See the [`config`] module for available configuration options.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use sentinel::builder::TreeBuilder;
use sentinel::config::Config;
use sentinel::dispatcher::{DispatcherConfig, EventDispatcher, Notification, TreeSnapshot};
use sentinel::render::render;
use sentinel::types::{ErrorEvent, ErrorKind, RunRequest, SentinelEvent};
use sentinel::watcher::{FileWatcher, WatchFilter};

/// Sentinel - test-watch event aggregation core.
///
/// Watches a source tree, asks an external runner to test changed packages,
/// and keeps a live pass/fail tree of the results.
#[derive(Parser, Debug)]
#[command(name = "sentinel")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    SENTINEL_WATCH_DIR         Root directory to watch (default: current dir)
    SENTINEL_DEBOUNCE_MS       Quiet period before a run fires (default: 100)
    SENTINEL_MAX_DELAY_MS      Longest a run can be postponed (default: 1000)
    SENTINEL_NOTIFY_CAPACITY   Notification ring size (default: 256)
    SENTINEL_RUN_QUEUE_SIZE    Pending run requests (default: 64)
    SENTINEL_WATCH_EXTENSIONS  Comma-separated extensions (default: go)
    SENTINEL_IGNORE_DIRS       Comma-separated directory names to skip
    RUST_LOG                   Log filter (default: info)

EXAMPLES:
    # Watch the current directory, piping requests to a runner
    my-runner | sentinel watch | my-runner-input

    # Print the tree recorded in an event log
    sentinel replay events.jsonl
")]
struct Cli {
    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Watch a source tree and drive the test runner.
    ///
    /// Reads runner events as JSON lines on stdin and writes run requests as
    /// JSON lines on stdout. The tree is printed to stderr as it changes.
    Watch {
        /// Directory to watch (overrides SENTINEL_WATCH_DIR).
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// List every test, not only those in failed packages.
        #[arg(short, long)]
        verbose: bool,
    },

    /// Apply a JSON-lines event log to an empty tree and print the result.
    Replay {
        /// Event log, one event per line.
        file: PathBuf,

        /// Print the tree as JSON instead of text.
        #[arg(long)]
        json: bool,

        /// List every test, not only those in failed packages.
        #[arg(short, long)]
        verbose: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Command::Replay {
            file,
            json,
            verbose,
        } => run_replay(&file, json, verbose),
        Command::Watch { root, verbose } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_watch(root, verbose))
        }
    }
}

/// Runs the watch loop until a shutdown signal arrives.
async fn run_watch(root: Option<PathBuf>, verbose: bool) -> Result<()> {
    info!("Starting Sentinel");

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(root) = root {
        config.watch_dir = root;
    }

    info!(
        watch_dir = %config.watch_dir.display(),
        debounce_ms = config.debounce.as_millis(),
        extensions = ?config.watch_extensions,
        "Configuration loaded"
    );

    let (runs_tx, mut runs_rx) = mpsc::channel::<RunRequest>(config.run_queue_size);
    let dispatcher = EventDispatcher::new(DispatcherConfig::from(&config), runs_tx);
    let mut subscription = dispatcher.subscribe();

    let (events_tx, mut events_rx) = mpsc::channel::<SentinelEvent>(config.notify_capacity);
    let watcher = FileWatcher::new(
        config.watch_dir.clone(),
        WatchFilter::from_config(&config),
        events_tx,
    )
    .with_context(|| {
        format!(
            "Failed to initialize file watcher for {}",
            config.watch_dir.display()
        )
    })?;

    info!(root = %watcher.root().display(), "Sentinel running. Press Ctrl+C to stop.");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stdout = tokio::io::stdout();

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }

            Some(event) = events_rx.recv() => {
                dispatcher.publish(event);
            }

            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => ingest_line(&dispatcher, &line),
                Ok(None) => {
                    info!("Runner input closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read runner input");
                    stdin_open = false;
                }
            },

            Some(request) = runs_rx.recv() => {
                let mut line = serde_json::to_string(&request)
                    .context("Failed to serialize run request")?;
                line.push('\n');
                stdout
                    .write_all(line.as_bytes())
                    .await
                    .context("Failed to write run request")?;
                stdout.flush().await.context("Failed to flush stdout")?;
            }

            Some(notification) = subscription.recv() => match notification {
                Notification::TreeChanged { revision } | Notification::TreeReset { revision } => {
                    debug!(revision, "Tree changed");
                    eprint!("{}", render(&dispatcher.snapshot(), verbose));
                }
                Notification::RunTriggered { package } => {
                    debug!(package = %package, "Run requested");
                }
                Notification::Error(error) => {
                    debug!(error = %error, "Error notification");
                }
            },
        }
    }

    if subscription.dropped() > 0 {
        warn!(dropped = subscription.dropped(), "Renderer fell behind");
    }
    dispatcher.unsubscribe(subscription);

    info!("Sentinel stopped");
    Ok(())
}

/// Parses one line of runner input and publishes it.
fn ingest_line(dispatcher: &EventDispatcher, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match serde_json::from_str::<SentinelEvent>(line) {
        Ok(event) => dispatcher.publish(event),
        Err(e) => {
            warn!(error = %e, "Unparseable runner input");
            dispatcher.publish(ErrorEvent::new(
                ErrorKind::MalformedInput,
                format!("unparseable input: {e}"),
            ));
        }
    }
}

/// Rebuilds a tree from an event log and prints it to stdout.
fn run_replay(file: &Path, json: bool, verbose: bool) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read event log {}", file.display()))?;

    let config = Config::from_env().context("Failed to load configuration")?;
    let mut builder = TreeBuilder::with_watch_extensions(config.watch_extensions);
    let mut revision = 0;

    for (index, line) in contents.lines().enumerate() {
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: SentinelEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping unparseable line");
                continue;
            }
        };

        match builder.apply(&event) {
            Ok(true) => revision += 1,
            Ok(false) => {}
            Err(e) => warn!(line = line_number, error = %e, "Skipping malformed event"),
        }
    }

    let tree = builder.tree();
    let snapshot = TreeSnapshot {
        revision,
        summary: tree.summary(),
        nodes: tree.snapshot(),
    };

    if json {
        let out =
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize snapshot")?;
        println!("{out}");
    } else {
        print!("{}", render(&snapshot, verbose));
    }
    Ok(())
}

/// Initializes the logging subsystem.
///
/// Logs go to stderr so stdout stays a clean JSON-lines channel. The level
/// comes from `RUST_LOG` and defaults to `info`.
fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        let json_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_file(false)
            .with_line_number(false);
        registry.with(json_layer).init();
    } else {
        let text_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true);
        registry.with(text_layer).init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
