//! Interactive chat host for the neo agent: a line-oriented REPL that
//! streams the agent's messages to stdout, with SIGINT aborting the current
//! turn at the next step boundary and a quick second SIGINT (or SIGTERM)
//! exiting immediately.

mod cli;

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

pub use cli::Cli;
use anyhow::Context;
use neo_core::SessionBuilder;
use neo_core::util::notify_on_sigint;
use neo_protocol::Message;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// How quickly a second SIGINT must follow the first to exit outright.
const DOUBLE_INTERRUPT_WINDOW: Duration = Duration::from_secs(1);

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let default_level = match cli.verbose {
        0 => "error",
        1 => "debug",
        _ => "trace",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let workspace = match cli.workspace {
        Some(workspace) => workspace.canonicalize().unwrap_or(workspace),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };

    let (session, mut agent) = SessionBuilder::new()
        .workspace(workspace.clone())
        .ephemeral(false)
        .initialize()?;
    println!("neo session {} in {}", session.id(), workspace.display());

    // First SIGINT interrupts the turn at the next step boundary; a second
    // one within the window exits immediately. SIGTERM always exits.
    let interrupt = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(Arc::clone(&interrupt));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            break; // EOF
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        if let Some(history_file) = &cli.history_file {
            append_history(history_file, input);
        }

        interrupt.store(false, Ordering::Relaxed);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let printer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                println!("{}", render_message(&message));
            }
        });

        agent
            .process_turn(input, None, Some(&tx), Some(&interrupt))
            .await;
        drop(tx);
        let _ = printer.await;
    }

    session.teardown().await;
    Ok(())
}

fn spawn_signal_watcher(interrupt: Arc<AtomicBool>) {
    let sigint = notify_on_sigint();
    tokio::spawn(async move {
        let mut last_interrupt: Option<Instant> = None;
        loop {
            sigint.notified().await;
            let now = Instant::now();
            if last_interrupt.is_some_and(|last| now.duration_since(last) < DOUBLE_INTERRUPT_WINDOW)
            {
                eprintln!("\nExiting.");
                std::process::exit(130);
            }
            last_interrupt = Some(now);
            interrupt.store(true, Ordering::Relaxed);
            eprintln!("\nInterrupting at the next step boundary (press again to exit).");
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
            debug!("received SIGTERM");
            std::process::exit(0);
        }
    });
}

fn append_history(path: &std::path::Path, input: &str) {
    let open = std::fs::OpenOptions::new().create(true).append(true).open(path);
    match open {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "{input}") {
                debug!("could not append to history file: {e}");
            }
        }
        Err(e) => debug!("could not open history file {}: {e}", path.display()),
    }
}

fn render_message(message: &Message) -> String {
    format!("[{}] {}", message.role, message.model_text())
}
