use std::{error::Error, num::NonZeroU64, process, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use evictune::{config::Config, events::Event, session::Session, token::AuthToken};

/// Profile to display when built in debug mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Ensure that this file is kept secure and not shared publicly, as it
    /// contains the token that grants access to your Evict account.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Guild to open the music session for
    #[arg(short, long, env = "EVICTUNE_GUILD")]
    guild: NonZeroU64,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Logs one session event at an appropriate level.
fn log_event(event: &Event, session: &Session) {
    match event {
        Event::Connected => info!("connected"),
        Event::Disconnected => info!("disconnected"),
        Event::TrackChanged { title, artist } => {
            let state = session.state();
            let queued = state.queue.len();
            if queued > 0 {
                info!("now playing: {title} by {artist} ({queued} queued)");
            } else {
                info!("now playing: {title} by {artist}");
            }
        }
        Event::Play => info!("playback resumed"),
        Event::Pause => info!("playback paused"),
    }
}

/// Main application loop.
///
/// Opens the session, relays its events to the log, and restarts it with
/// some jitter after a terminal connection error. Shuts down cleanly on
/// Ctrl-C.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let token = AuthToken::from_file(&args.secrets_file)?;
    let config = Config::new(args.guild, token);

    let mut session = Session::new(config)?;
    let mut events = session
        .events()
        .ok_or("session events already taken")?;
    let mut status = session.watch_status();

    session.start();

    let restart_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(restart_timer);
    let mut restart_pending = false;

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                session.stop().await;
                break Ok(());
            }

            Some(event) = events.recv() => log_event(&event, &session),

            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }

                let current = status.borrow_and_update().clone();
                if !current.connected {
                    if let Some(e) = current.error {
                        error!("{e}");

                        // Sleep with jitter to prevent thundering herds
                        // against the service when many clients restart at
                        // once.
                        let duration = Duration::from_millis(fastrand::u64(5_000..6_000));
                        info!("restarting in {:.1}s", duration.as_secs_f32());
                        restart_timer.as_mut().reset(tokio::time::Instant::now() + duration);
                        restart_pending = true;
                    }
                }
            }

            () = &mut restart_timer, if restart_pending => {
                restart_pending = false;
                session.start();
            }
        }
    }
}

/// Main entry point of the application.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {args:#?}");

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
