//! Update, watch and check command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use otaflash::net::DEFAULT_PORT;
use otaflash::net::http::{DEFAULT_TIMEOUT, parse_fingerprint};
use otaflash::port::DEFAULT_BAUD;
use otaflash::{
    BridgeProgrammer, CycleOutcome, CycleReport, DeviceProgrammer, DirStore, Endpoint, Fetcher,
    FileStore, HttpFetcher, NativePort, Orchestrator, UpdateConfig,
};
use std::thread;
use std::time::{Duration, Instant};

use crate::commands::print_json;
use crate::config::Config;
use crate::serial::select_bridge_port;
use crate::{Cli, CliError, clear_interrupted_flag, use_fancy_output, was_interrupted};

/// Seconds between watch cycles when nothing is configured.
const DEFAULT_WATCH_INTERVAL_SECS: u64 = 300;

/// Pause before the cycle that follows a restart request.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Port used for plain HTTP sources.
const HTTP_PORT: u16 = 80;

/// Build the update source and policy from flags and config.
pub(crate) fn update_config(cli: &Cli, config: &Config) -> Result<UpdateConfig> {
    let source = &config.source;
    let host = cli
        .host
        .clone()
        .or_else(|| source.host.clone())
        .ok_or_else(|| {
            CliError::Usage(
                "no firmware server configured, pass --host or set [source] host".to_string(),
            )
        })?;

    let tls = !(cli.insecure_http || source.insecure_http);
    let default_port = if tls { DEFAULT_PORT } else { HTTP_PORT };
    let port = cli.server_port.or(source.port).unwrap_or(default_port);
    let mut endpoint = Endpoint::new(host, port).with_tls(tls);

    if let Some(fingerprint) = cli.fingerprint.as_ref().or(source.fingerprint.as_ref()) {
        parse_fingerprint(fingerprint).context("invalid certificate fingerprint")?;
        endpoint = endpoint.with_fingerprint(fingerprint.clone());
    }

    let mut update = UpdateConfig::new(endpoint);
    if let Some(base_path) = cli.base_path.as_ref().or(source.base_path.as_ref()) {
        update = update.with_base_path(base_path.clone());
    }
    if let Some(version_file) = &source.version_file {
        update = update.with_version_file(version_file.clone());
    }
    if let Some(max_retries) = config.update.max_retries {
        update = update.with_max_retries(max_retries);
    }
    debug!("Update source: {}", update.version_request());
    Ok(update)
}

/// Open the artifact store.
pub(crate) fn open_store(cli: &Cli, config: &Config) -> Result<DirStore> {
    let dir = cli
        .store_dir
        .clone()
        .or_else(|| config.store.dir.clone())
        .or_else(Config::default_store_dir)
        .ok_or_else(|| {
            CliError::Usage("no store directory, pass --store or set [store] dir".to_string())
        })?;
    DirStore::open(&dir).with_context(|| format!("opening store at {}", dir.display()))
}

fn open_bridge(cli: &Cli, config: &Config) -> Result<BridgeProgrammer<NativePort>> {
    let port = select_bridge_port(cli, config)?;
    let baud = cli.baud.or(config.device.baud).unwrap_or(DEFAULT_BAUD);
    if !cli.quiet {
        eprintln!(
            "{} Using bridge on {} at {} baud",
            style("🔌").cyan(),
            style(&port).cyan(),
            baud
        );
    }
    BridgeProgrammer::open(&port, baud).with_context(|| format!("opening bridge on {port}"))
}

fn upload_progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message("uploading");
    pb
}

/// Run one cycle with a progress bar attached.
fn run_cycle<F, S, D>(
    cli: &Cli,
    update: UpdateConfig,
    fetcher: F,
    store: S,
    device: D,
) -> Result<CycleReport>
where
    F: Fetcher,
    S: FileStore,
    D: DeviceProgrammer,
{
    let pb = upload_progress_bar(cli);
    let report = Orchestrator::new(update, fetcher, store, device)
        .with_progress(|done, total| {
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        })
        .run_cycle()
        .context("update cycle failed")?;
    pb.finish_and_clear();
    Ok(report)
}

fn print_report(cli: &Cli, report: &CycleReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    if cli.quiet {
        return Ok(());
    }

    let icon = match &report.outcome {
        CycleOutcome::Updated { .. } => style("🎉").green().bold(),
        CycleOutcome::UpToDate | CycleOutcome::NoUpdateAvailable => style("✓").green(),
        CycleOutcome::RestartRequired { .. } | CycleOutcome::ResetToBootloader => {
            style("🔄").yellow()
        },
        CycleOutcome::RetryExceeded => style("✗").red().bold(),
    };
    eprintln!("{icon} {}", report.outcome);
    debug!(
        "States: {}",
        report
            .history
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    if report.retry_count > 0 {
        eprintln!(
            "  {} failed attempts so far: {}",
            style("•").dim(),
            report.retry_count
        );
    }
    Ok(())
}

/// Map a cycle outcome to the process result.
fn outcome_result(outcome: &CycleOutcome) -> Result<()> {
    match outcome {
        CycleOutcome::UpToDate | CycleOutcome::NoUpdateAvailable | CycleOutcome::Updated { .. } => {
            Ok(())
        },
        CycleOutcome::RestartRequired { .. } | CycleOutcome::ResetToBootloader => {
            Err(CliError::RestartRequired(outcome.to_string()).into())
        },
        CycleOutcome::RetryExceeded => Err(anyhow::anyhow!("{outcome}")),
    }
}

/// Update command implementation.
pub(crate) fn cmd_update(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let update = update_config(cli, config)?;
    let store = open_store(cli, config)?;
    let fetcher = HttpFetcher::new(DEFAULT_TIMEOUT).context("creating HTTP client")?;
    let device = open_bridge(cli, config)?;

    let report = run_cycle(cli, update, fetcher, store, device)?;
    if was_interrupted() {
        return Err(CliError::Cancelled("update interrupted".to_string()).into());
    }
    print_report(cli, &report, json)?;
    outcome_result(&report.outcome)
}

/// Sleep for `total`, waking early on Ctrl-C. Returns `false` if interrupted.
fn sleep_interruptible(total: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let start = Instant::now();
    while start.elapsed() < total {
        if was_interrupted() {
            return false;
        }
        thread::sleep(SLICE.min(total.saturating_sub(start.elapsed())));
    }
    !was_interrupted()
}

/// Watch command implementation.
pub(crate) fn cmd_watch(cli: &Cli, config: &Config, interval: Option<u64>) -> Result<()> {
    let interval = Duration::from_secs(
        interval
            .or(config.update.watch_interval_secs)
            .unwrap_or(DEFAULT_WATCH_INTERVAL_SECS),
    );
    let update = update_config(cli, config)?;
    let mut store = open_store(cli, config)?;
    let mut fetcher = HttpFetcher::new(DEFAULT_TIMEOUT).context("creating HTTP client")?;
    let mut device = open_bridge(cli, config)?;

    if !cli.quiet {
        eprintln!(
            "{} Checking every {}s, press Ctrl-C to stop",
            style("👀").cyan(),
            interval.as_secs()
        );
    }

    let mut cycle = 0u64;
    loop {
        cycle += 1;
        info!("Update cycle {cycle}");
        let report = run_cycle(cli, update.clone(), &mut fetcher, &mut store, &mut device)?;
        print_report(cli, &report, false)?;
        if was_interrupted() {
            break;
        }

        let wait = if report.outcome.requires_restart() {
            RESTART_DELAY
        } else {
            interval
        };
        if !sleep_interruptible(wait) {
            break;
        }
    }

    clear_interrupted_flag();
    if !cli.quiet {
        eprintln!("{} Stopped after {cycle} cycles", style("✓").green());
    }
    Ok(())
}

/// Check command implementation.
pub(crate) fn cmd_check(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let update = update_config(cli, config)?;
    let store = open_store(cli, config)?;
    let fetcher = HttpFetcher::new(DEFAULT_TIMEOUT).context("creating HTTP client")?;

    let check = Orchestrator::new(update, fetcher, store, ()).check_version();

    if json {
        return print_json(&check);
    }

    let unknown = || style("unknown").dim().to_string();
    let onboard = if check.onboard.is_empty() {
        unknown()
    } else {
        check.onboard.clone()
    };
    println!("onboard:  {onboard}");
    println!(
        "latest:   {}",
        check.latest.clone().unwrap_or_else(unknown)
    );
    if let Some(staged) = &check.staged {
        println!("staged:   {staged}");
    }
    println!("retries:  {}", check.retry_count);

    if !cli.quiet {
        if check.update_available() {
            eprintln!("{} Update available", style("⬆").yellow());
        } else {
            eprintln!("{} Up to date", style("✓").green());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use otaflash::FailureReason;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["otaflash"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn exit_class(result: Result<()>) -> Option<i32> {
        let err = result.err()?;
        Some(match err.downcast_ref::<CliError>() {
            Some(CliError::Usage(_)) => 2,
            Some(CliError::RestartRequired(_)) => 3,
            Some(CliError::Cancelled(_)) => 130,
            None => 1,
        })
    }

    #[test]
    fn test_update_config_requires_host() {
        let err = update_config(&cli(&["check"]), &Config::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_update_config_flags_override_file() {
        let mut config = Config::default();
        config.source.host = Some("file.example.com".to_string());
        config.source.base_path = Some("/file".to_string());
        config.update.max_retries = Some(5);

        let update = update_config(
            &cli(&["check", "--host", "flag.example.com", "--base-path", "/acme"]),
            &config,
        )
        .unwrap();

        assert_eq!(update.endpoint.host, "flag.example.com");
        assert_eq!(update.endpoint.port, 443);
        assert_eq!(update.max_retries, 5);
        assert_eq!(update.version_request().path, "/acme/fw-latest.md");
    }

    #[test]
    fn test_update_config_plain_http() {
        let mut config = Config::default();
        config.source.host = Some("192.168.1.10".to_string());
        config.source.insecure_http = true;

        let update = update_config(&cli(&["check"]), &config).unwrap();
        assert!(!update.endpoint.tls);
        assert_eq!(update.endpoint.port, 80);
        assert!(update.version_request().url().starts_with("http://192.168.1.10:80/"));
    }

    #[test]
    fn test_update_config_insecure_http_flag() {
        let update = update_config(
            &cli(&["check", "--host", "10.0.0.2", "--insecure-http", "--server-port", "8080"]),
            &Config::default(),
        )
        .unwrap();
        assert!(!update.endpoint.tls);
        assert_eq!(update.endpoint.port, 8080);
    }

    #[test]
    fn test_update_config_rejects_bad_fingerprint() {
        let mut config = Config::default();
        config.source.host = Some("fw.example.com".to_string());
        config.source.fingerprint = Some("not-hex".to_string());
        assert!(update_config(&cli(&["check"]), &config).is_err());
    }

    #[test]
    fn test_outcome_exit_classes() {
        assert_eq!(exit_class(outcome_result(&CycleOutcome::UpToDate)), None);
        assert_eq!(
            exit_class(outcome_result(&CycleOutcome::Updated {
                version: "1.1".to_string()
            })),
            None
        );
        assert_eq!(
            exit_class(outcome_result(&CycleOutcome::RestartRequired {
                reason: FailureReason::DeviceNotFound
            })),
            Some(3)
        );
        assert_eq!(
            exit_class(outcome_result(&CycleOutcome::ResetToBootloader)),
            Some(3)
        );
        assert_eq!(
            exit_class(outcome_result(&CycleOutcome::RetryExceeded)),
            Some(1)
        );
    }

    #[test]
    fn test_sleep_interruptible_zero() {
        assert!(sleep_interruptible(Duration::ZERO));
    }
}
