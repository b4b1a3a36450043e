//! otaflash CLI - Command-line tool for over-the-air firmware updates.
//!
//! ## Features
//!
//! - Run a single update cycle or watch for new releases
//! - Check onboard, staged and published versions
//! - Decode and dump Intel HEX files
//! - Inspect and format the artifact store
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed since the last reset.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Forget a handled Ctrl-C.
pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Errors that select a specific exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or missing setup. Exit code 2.
    #[error("{0}")]
    Usage(String),
    /// The update cycle asked to be restarted. Exit code 3.
    #[error("{0}")]
    RestartRequired(String),
    /// Interrupted by the user. Exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::RestartRequired(_) => 3,
            Self::Cancelled(_) => 130,
        }
    }
}

/// otaflash - Over-the-air firmware updates for bus bootloaders.
///
/// Environment variables:
///   OTAFLASH_HOST               - Firmware server host
///   OTAFLASH_FINGERPRINT        - SHA-256 certificate fingerprint to pin
///   OTAFLASH_STORE              - Artifact store directory
///   OTAFLASH_PORT               - Serial port of the bus bridge
///   OTAFLASH_BAUD               - Bridge baud rate (default: 115200)
///   OTAFLASH_NON_INTERACTIVE    - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "otaflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Firmware server host.
    #[arg(long, global = true, env = "OTAFLASH_HOST")]
    host: Option<String>,

    /// Firmware server port.
    #[arg(long, global = true, env = "OTAFLASH_SERVER_PORT")]
    server_port: Option<u16>,

    /// SHA-256 fingerprint of the server certificate (hex, ':' separated).
    #[arg(long, global = true, env = "OTAFLASH_FINGERPRINT")]
    fingerprint: Option<String>,

    /// Release directory on the server.
    #[arg(long, global = true, env = "OTAFLASH_BASE_PATH")]
    base_path: Option<String>,

    /// Fetch over plain HTTP (local test servers only).
    #[arg(long, global = true)]
    insecure_http: bool,

    /// Artifact store directory.
    #[arg(long = "store", global = true, env = "OTAFLASH_STORE", value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// Serial port of the bus bridge (auto-detected if not specified).
    #[arg(short, long, global = true, env = "OTAFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the bus bridge.
    #[arg(short, long, global = true, env = "OTAFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "OTAFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run one update cycle.
    Update {
        /// Output the cycle report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run update cycles until interrupted.
    Watch {
        /// Seconds to wait between cycles.
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Compare onboard, staged and published versions.
    Check {
        /// Output the version check as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Decode an Intel HEX file.
    Decode {
        /// Path to the HEX file.
        file: PathBuf,

        /// Output the decode summary as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Print the assembled payload as a hex dump.
        #[arg(long)]
        dump: bool,
    },

    /// Inspect the artifact store.
    Store {
        #[command(subcommand)]
        action: StoreCommand,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Artifact store actions.
#[derive(Subcommand)]
enum StoreCommand {
    /// List stored documents.
    List {
        /// Output the listing as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Print a stored document.
    Show {
        /// Document name.
        name: String,
    },

    /// Remove every stored document.
    Format {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if std::env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Help, version and usage errors exit here with clap's codes (0 / 2)
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "otaflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Cannot install Ctrl-C handler: {e}");
    }
    otaflash::set_interrupt_checker(was_interrupted);

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => report_error(&err),
    };
    process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    let config = Config::load(cli.config_path.as_deref());

    match &cli.command {
        Commands::Update { json } => commands::update::cmd_update(cli, &config, *json),
        Commands::Watch { interval } => commands::update::cmd_watch(cli, &config, *interval),
        Commands::Check { json } => commands::update::cmd_check(cli, &config, *json),
        Commands::Decode { file, json, dump } => {
            commands::decode::cmd_decode(cli, file, *json, *dump)
        },
        Commands::Store { action } => match action {
            StoreCommand::List { json } => commands::store::cmd_store_list(cli, &config, *json),
            StoreCommand::Show { name } => commands::store::cmd_store_show(cli, &config, name),
            StoreCommand::Format { yes } => commands::store::cmd_store_format(cli, &config, *yes),
        },
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: otaflash completions bash, \
                         or use otaflash completions --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Print an error chain to stderr and pick the exit code.
fn report_error(err: &anyhow::Error) -> i32 {
    eprintln!("{} {err}", style("Error:").red().bold());
    for cause in err.chain().skip(1) {
        eprintln!("  {} {cause}", style("caused by:").dim());
    }

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    if let Some(otaflash::Error::Interrupted) = err.downcast_ref::<otaflash::Error>() {
        return 130;
    }
    if let Some(otaflash::Error::Config(_)) = err.downcast_ref::<otaflash::Error>() {
        return 2;
    }
    1
}
