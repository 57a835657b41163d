//! pinentry-client - Drive a pinentry program from the command line.
//!
//! Useful from shell scripts that need a PIN, a confirmation or a message
//! box, and for checking which pinentry program a system is set up with.
//!
//! # Usage
//!
//! ```bash
//! # Ask for a passphrase; it is printed on stdout
//! pinentry-client --title "Backup" getpin --prompt "Passphrase:"
//!
//! # Ask twice, with a live quality bar
//! pinentry-client getpin --repeat "Again:" --quality
//!
//! # Yes/no question; exit code 0 for yes, 1 for no
//! pinentry-client --desc "Delete all backups?" confirm
//!
//! # Which pinentry is in use?
//! pinentry-client info flavor
//! ```
//!
//! # Exit codes
//!
//! - 0: success (or confirmed)
//! - 1: declined, or any error
//! - 2: cancelled by the user

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use secrecy::ExposeSecret;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pinentry_core::protocol::combine;
use pinentry_core::{Config, InfoKind, ProcessTransport, ProtocolError, Session, SessionBuilder};

const EXIT_DECLINED: u8 = 1;
const EXIT_CANCELLED: u8 = 2;

/// Drive a pinentry program from the command line.
#[derive(Parser)]
#[command(name = "pinentry-client")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file [default: ~/.config/pinentry-client/config.toml]
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Pinentry program to start (overrides config and gpg-agent.conf)
    #[arg(short, long, value_name = "PROGRAM", global = true)]
    program: Option<String>,

    /// Window title
    #[arg(long, global = true)]
    title: Option<String>,

    /// Descriptive text shown in the dialog
    #[arg(long = "desc", value_name = "TEXT", global = true)]
    description: Option<String>,

    /// Cancel the dialog after this many seconds
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    /// Increase log verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only show errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask for a PIN and print it on stdout
    #[command(alias = "pin")]
    Getpin {
        /// Label in front of the entry field
        #[arg(long)]
        prompt: Option<String>,

        /// Ask twice, labelling the second field with TEXT
        #[arg(long, value_name = "TEXT")]
        repeat: Option<String>,

        /// Show a quality bar while typing
        #[arg(long)]
        quality: bool,

        /// Error text shown above the entry field
        #[arg(long, value_name = "TEXT")]
        error: Option<String>,

        /// Key identifier for the external password cache
        #[arg(long, value_name = "KEYINFO")]
        key_info: Option<String>,
    },

    /// Ask a yes/no question
    Confirm {
        /// Show only one button
        #[arg(long)]
        one_button: bool,

        /// Text of the affirmative button
        #[arg(long, value_name = "TEXT")]
        ok: Option<String>,

        /// Text of the negative button
        #[arg(long, value_name = "TEXT")]
        not_ok: Option<String>,
    },

    /// Show a message
    #[command(alias = "msg")]
    Message,

    /// Remove a passphrase from the external password cache
    ClearPassphrase {
        /// Cache identifier, as passed to --key-info
        id: String,
    },

    /// Query the pinentry program
    Info {
        #[arg(value_enum)]
        what: InfoArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum InfoArg {
    Version,
    Pid,
    Flavor,
    Ttyinfo,
}

impl From<InfoArg> for InfoKind {
    fn from(arg: InfoArg) -> Self {
        match arg {
            InfoArg::Version => InfoKind::Version,
            InfoArg::Pid => InfoKind::Pid,
            InfoArg::Flavor => InfoKind::Flavor,
            InfoArg::Ttyinfo => InfoKind::TtyInfo,
        }
    }
}

fn setup_logging(level: &str) {
    // RUST_LOG overrides the CLI flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries results, so logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration from specified path");
            Config::load_from(path).context("Failed to load configuration")?
        }
        None => Config::load().context("Failed to load configuration")?,
    };
    Ok(apply_overrides(cli, config))
}

/// Command-line flags take precedence over the config file.
fn apply_overrides(cli: &Cli, mut config: Config) -> Config {
    if let Some(program) = &cli.program {
        config.pinentry.program = Some(program.clone());
    }
    if let Some(title) = &cli.title {
        config.prompt.title = Some(title.clone());
    }
    if let Some(description) = &cli.description {
        config.prompt.description = Some(description.clone());
    }
    if let Some(timeout) = cli.timeout {
        config.pinentry.timeout = Some(timeout);
    }
    config
}

/// Rough strength estimate: length plus character variety.
///
/// Short PINs score negative so the bar turns red.
fn estimate_quality(pin: &str) -> Option<i32> {
    if pin.is_empty() {
        return None;
    }
    let length = pin.chars().count() as i32;
    let classes = [
        pin.chars().any(|c| c.is_lowercase()),
        pin.chars().any(|c| c.is_uppercase()),
        pin.chars().any(|c| c.is_ascii_digit()),
        pin.chars().any(|c| !c.is_alphanumeric()),
    ]
    .iter()
    .filter(|&&present| present)
    .count() as i32;

    let score = length * 5 + classes * 10;
    Some(if length < 8 { -score } else { score })
}

fn start(builder: SessionBuilder) -> Result<Session<ProcessTransport>> {
    builder.spawn().context("Failed to start pinentry")
}

/// Close the session. If both the operation and the close fail, both are
/// reported.
fn finish<R>(
    session: Session<ProcessTransport>,
    result: std::result::Result<R, ProtocolError>,
) -> std::result::Result<R, ProtocolError> {
    let closed = session.close();
    match result {
        Ok(value) => closed.map(|()| value),
        Err(e) => Err(combine(e, closed)),
    }
}

/// Map an operation result to an exit code, treating cancellation as a
/// normal outcome.
fn report<R>(
    result: std::result::Result<R, ProtocolError>,
    on_success: impl FnOnce(R) -> Result<ExitCode>,
) -> Result<ExitCode> {
    match result {
        Ok(value) => on_success(value),
        Err(e) if e.is_cancelled() => {
            debug!(error = %e, "Cancelled by user");
            eprintln!("Cancelled");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        Err(e) => Err(e).context("pinentry failed"),
    }
}

fn cmd_getpin(
    builder: SessionBuilder,
    prompt: Option<String>,
    repeat: Option<String>,
    quality: bool,
    error: Option<String>,
    key_info: Option<String>,
) -> Result<ExitCode> {
    let mut builder = builder;
    if let Some(prompt) = prompt {
        builder = builder.prompt(prompt);
    }
    if let Some(repeat) = repeat {
        builder = builder.repeat(repeat);
    }
    if quality {
        builder = builder.quality_bar(estimate_quality);
    }
    if let Some(error) = error {
        builder = builder.error_text(error);
    }
    if let Some(key_info) = key_info {
        builder = builder
            .key_info(key_info)
            .option(pinentry_core::codec::options::ALLOW_EXTERNAL_PASSWORD_CACHE);
    }

    let mut session = start(builder)?;
    let result = session.get_pin();
    report(finish(session, result), |secret| {
        debug!(
            password_from_cache = secret.password_from_cache,
            pin_repeated = secret.pin_repeated,
            "PIN entered"
        );
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", secret.pin.expose_secret()).context("Failed to write PIN")?;
        stdout.flush().context("Failed to write PIN")?;
        Ok(ExitCode::SUCCESS)
    })
}

fn cmd_confirm(
    builder: SessionBuilder,
    one_button: bool,
    ok: Option<String>,
    not_ok: Option<String>,
) -> Result<ExitCode> {
    let mut builder = builder;
    if let Some(ok) = ok {
        builder = builder.ok_label(ok);
    }
    if let Some(not_ok) = not_ok {
        builder = builder.not_ok_label(not_ok);
    }

    let mut session = start(builder)?;
    let option = if one_button { "--one-button" } else { "" };
    let result = session.confirm(option);
    report(finish(session, result), |confirmed| {
        Ok(if confirmed {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(EXIT_DECLINED)
        })
    })
}

fn cmd_message(builder: SessionBuilder) -> Result<ExitCode> {
    let mut session = start(builder)?;
    let result = session.message();
    report(finish(session, result), |()| Ok(ExitCode::SUCCESS))
}

fn cmd_clear_passphrase(builder: SessionBuilder, id: &str) -> Result<ExitCode> {
    let mut session = start(builder)?;
    let result = session.clear_passphrase(id);
    report(finish(session, result), |()| {
        info!(cache_id = id, "Cleared cached passphrase");
        Ok(ExitCode::SUCCESS)
    })
}

fn cmd_info(builder: SessionBuilder, what: InfoArg) -> Result<ExitCode> {
    let mut session = start(builder)?;
    let result = session.get_info(what.into());
    report(finish(session, result), |value| {
        println!("{}", value);
        Ok(ExitCode::SUCCESS)
    })
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Determine log level from CLI flags
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };
    setup_logging(log_level);

    let config = load_config(&cli)?;
    let builder = config.builder();

    match cli.command {
        Commands::Getpin {
            prompt,
            repeat,
            quality,
            error,
            key_info,
        } => cmd_getpin(builder, prompt, repeat, quality, error, key_info),
        Commands::Confirm {
            one_button,
            ok,
            not_ok,
        } => cmd_confirm(builder, one_button, ok, not_ok),
        Commands::Message => cmd_message(builder),
        Commands::ClearPassphrase { id } => cmd_clear_passphrase(builder, &id),
        Commands::Info { what } => cmd_info(builder, what),
    }
}
