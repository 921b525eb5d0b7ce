//! tripsync - view, watch and edit shared trip itineraries from a terminal.
//!
//! Reads are served from the local cache first and revalidated against the
//! backend; edits are applied optimistically and rolled back if the server
//! rejects them.

mod commands;
mod render;

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tripsync_core::SyncError;
use uuid::Uuid;

use commands::Context;

#[derive(Parser, Debug)]
#[command(name = "tripsync", version, about = "Shared trip itineraries, offline-first")]
struct Cli {
    /// Serve cached data only; never contact the backend
    #[arg(long, global = true)]
    offline: bool,

    /// Write logs to daily files in this directory instead of stderr
    #[arg(long, global = true, env = "TRIPSYNC_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: Option<String>,
        /// Remember the password in the OS keychain
        #[arg(long)]
        remember: bool,
    },
    /// Sign out and delete the stored session
    Logout {
        /// Also remove the remembered password
        #[arg(long)]
        forget: bool,
    },
    /// Print a trip
    Show {
        trip: Uuid,
        #[arg(long)]
        json: bool,
    },
    /// Keep a trip open and print changes as they arrive
    Watch {
        trip: Uuid,
        /// Also revalidate every N seconds
        #[arg(long)]
        poll: Option<u64>,
    },
    /// Move an itinerary item to a position in a section
    MoveItem {
        trip: Uuid,
        item: Uuid,
        #[arg(long)]
        section: Uuid,
        #[arg(long)]
        index: usize,
    },
    /// Append an item to a section
    AddItem {
        trip: Uuid,
        #[arg(long)]
        section: Uuid,
        #[arg(long)]
        title: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Add or remove a trip tag
    Tag {
        trip: Uuid,
        #[command(subcommand)]
        action: TagAction,
    },
}

#[derive(Subcommand, Debug)]
enum TagAction {
    Add { name: String },
    Remove { name: String },
}

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). The returned guard must
/// live until exit so buffered file output is flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tripsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref());
    info!(command = ?cli.command, offline = cli.offline, "Starting tripsync");

    let mut ctx = Context::new(cli.offline)?;
    let result = match cli.command {
        Command::Login { email, remember } => ctx.login(email, remember).await,
        Command::Logout { forget } => ctx.logout(forget),
        Command::Show { trip, json } => ctx.show(trip, json).await,
        Command::Watch { trip, poll } => ctx.watch(trip, poll).await,
        Command::MoveItem {
            trip,
            item,
            section,
            index,
        } => ctx.move_item(trip, item, section, index).await,
        Command::AddItem {
            trip,
            section,
            title,
            location,
            notes,
        } => ctx.add_item(trip, section, title, location, notes).await,
        Command::Tag { trip, action } => match action {
            TagAction::Add { name } => ctx.add_tag(trip, &name).await,
            TagAction::Remove { name } => ctx.remove_tag(trip, &name).await,
        },
    };

    result.map_err(|err| {
        if matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Unauthorized)) {
            err.context("Session rejected. Run `tripsync login` again.")
        } else {
            err
        }
    })
}
