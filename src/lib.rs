pub mod types;
pub mod error;
pub mod config;
pub mod bracket;
pub mod pairing;
pub mod tiebreak;
pub mod controller;
pub mod session;
pub mod lichess;
pub mod state_server;

use config::*;
use bracket::match_rounds;
use controller::{platform_rounds, CancelToken, ControllerOptions, SwissPlatform, SystemClock, TournamentController};
use error::{KnockoutError, KnockoutResult};
use lichess::LichessClient;
use session::SessionJournal;
use state_server::{spawn_state_server, SnapshotWriter};
use types::*;

use std::{
    fs,
    sync::{Arc, Mutex},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ── Entry point ────────────────────────────────────────────────────────

pub fn run() -> KnockoutResult<Competitor> {
    load_env_file();

    // Initialize tracing with file output
    let logs_dir = logs_dir();
    fs::create_dir_all(&logs_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "knockout.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    info!("Swiss knockout starting");
    log_env_warnings();

    let config = load_config_inner().map_err(KnockoutError::InvalidConfig)?;
    validate_config(&config)?;

    let outcome = run_event(&config);
    match &outcome {
        Ok(champion) => info!("Tournament finished, champion {}", champion.username),
        Err(KnockoutError::Cancelled) => warn!("Tournament paused; rerun to resume from {}", session_path().display()),
        Err(err) => error!("Tournament failed: {err}"),
    }
    outcome
}

fn run_event(config: &KnockoutConfig) -> KnockoutResult<Competitor> {
    let now = now_ms();
    let options = ControllerOptions::from_config(config, now)?;
    let journal_path = session_path();
    let mut platform = LichessClient::new(config)?;

    let mut controller = match SessionJournal::load(&journal_path)? {
        Some(journal) => {
            info!("Resuming event {} from {}", journal.event_id, journal_path.display());
            let field = if journal.competitors.is_empty() {
                config.max_participants
            } else {
                journal.competitors.len()
            };
            let nb_rounds = platform_rounds(match_rounds(field), config.games_per_match, config.armageddon);
            platform.attach(&journal.event_id, journal.starts_at_ms, nb_rounds);
            TournamentController::resume(platform, SystemClock, rand::rng(), options, journal)?
        }
        None => {
            platform.create_event(config, options.starts_at_ms)?;
            TournamentController::new(platform, SystemClock, rand::rng(), options)
        }
    }
    .with_journal(journal_path);
    controller.save_session()?;
    spawn_interrupt_watcher(controller.cancel_token());

    let shared: SharedBracketState = Arc::new(Mutex::new(None));
    let bracket_dir = resolve_repo_path(&config.bracket_dir);
    controller.add_listener(Box::new(shared.clone()));
    controller.add_listener(Box::new(SnapshotWriter::new(bracket_dir.clone())));
    if !config.state_server_addr.trim().is_empty() {
        spawn_state_server(shared, bracket_dir, config.state_server_addr.clone());
    }

    info!("Event page: {}", controller.platform().event_url());
    info!("Running event {}", controller.platform().event_id());
    controller.run()
}

/// Cancel the run on Ctrl-C; the controller stops at its next poll.
fn spawn_interrupt_watcher(cancel: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to start the interrupt watcher: {e}");
                return;
            }
        };
        runtime.block_on(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Interrupt received, stopping after the current poll");
                    cancel.cancel();
                }
                Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
            }
        });
    });
}
