//! Argument parsing, bootstrap, and the batch run behind the `tescan` binary.

use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use clap::Parser;
use tescan_appliance::HttpAppliance;
use tescan_config::{ConfigSources, LogStyle, RawConfig, ScannerConfig, load};
use tescan_scan::{BatchCoordinator, ScanOrchestrator};
use tescan_telemetry::{LogFormat, LoggingConfig, Metrics, build_sha, init_logging};
use tracing::{info, warn};

use crate::error::{CliError, CliResult, EXIT_FILE_ERRORS};
use crate::output::{OutputFormat, render_summary};

/// Parse process arguments and environment, run one batch, and return the
/// process exit code.
pub async fn run() -> i32 {
    run_with(env::args_os(), env::vars().collect()).await
}

/// Like [`run`], with arguments and environment supplied by the caller.
///
/// Exit codes: `0` clean run, `1` some file ended without a verdict, `2`
/// invalid arguments or configuration, `3` the run itself failed.
pub async fn run_with<I, T>(args: I, env: HashMap<String, String>) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return err.exit_code();
        }
    };

    match execute(cli, env).await {
        Ok(exit_code) => exit_code,
        Err(err) => {
            eprintln!("error: {}", err.display_message());
            err.exit_code()
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "tescan",
    version,
    about = "Submit a directory tree to a Threat Emulation appliance and sort files by verdict"
)]
pub(crate) struct Cli {
    #[arg(short = 'c', long, value_name = "FILE", help = "YAML configuration file")]
    config: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    input_directory: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    reports_directory: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    benign_directory: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    quarantine_directory: Option<PathBuf>,
    #[arg(long, value_name = "DIR")]
    error_directory: Option<PathBuf>,
    #[arg(long, help = "Appliance host, host:port, or full API URL")]
    appliance_ip: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long, help = "Skip TLS certificate verification")]
    accept_invalid_certs: bool,
    #[arg(long, help = "Ordinary files analysed at once")]
    concurrency: Option<u64>,
    #[arg(long, value_name = "SECS", help = "Seconds between polls")]
    seconds_to_wait: Option<u64>,
    #[arg(long, value_name = "SECS", help = "Seconds before the first poll")]
    initial_poll_delay: Option<u64>,
    #[arg(long, help = "Poll attempts before giving up on a file")]
    max_retries: Option<u64>,
    #[arg(long, help = "Attempts per file relocation")]
    transfer_retries: Option<u64>,
    #[arg(long, value_name = "SECS", help = "Initial relocation backoff")]
    transfer_backoff: Option<u64>,
    #[arg(long, help = "Attempts per appliance request")]
    request_retries: Option<u64>,
    #[arg(long, value_name = "SECS")]
    http_timeout: Option<u64>,
    #[arg(long, value_delimiter = ',', help = "Extensions routed to the archive lane")]
    archive_extensions: Vec<String>,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long, value_parser = parse_log_style, help = "pretty or json")]
    log_format: Option<LogStyle>,
    #[arg(
        long = "output",
        alias = "format",
        value_enum,
        default_value_t = OutputFormat::Table,
        help = "Summary format"
    )]
    output: OutputFormat,
    #[arg(long, value_name = "FILE", help = "Write Prometheus metrics here after the run")]
    metrics_file: Option<PathBuf>,
}

impl Cli {
    fn raw_config(&self) -> RawConfig {
        RawConfig {
            input_directory: self.input_directory.clone(),
            reports_directory: self.reports_directory.clone(),
            benign_directory: self.benign_directory.clone(),
            quarantine_directory: self.quarantine_directory.clone(),
            error_directory: self.error_directory.clone(),
            appliance_ip: self.appliance_ip.clone(),
            api_key: self.api_key.clone(),
            accept_invalid_certs: self.accept_invalid_certs.then_some(true),
            concurrency: self.concurrency,
            seconds_to_wait: self.seconds_to_wait,
            initial_poll_delay: self.initial_poll_delay,
            max_retries: self.max_retries,
            transfer_retries: self.transfer_retries,
            transfer_backoff: self.transfer_backoff,
            request_retries: self.request_retries,
            http_timeout: self.http_timeout,
            archive_extensions: (!self.archive_extensions.is_empty())
                .then(|| self.archive_extensions.clone()),
            log_level: self.log_level.clone(),
            log_format: self.log_format,
        }
    }
}

fn parse_log_style(input: &str) -> Result<LogStyle, String> {
    input.parse::<LogStyle>().map_err(|err| err.describe())
}

fn resolve_config(cli: &Cli, env: HashMap<String, String>) -> CliResult<ScannerConfig> {
    let base_dir = env::current_dir()
        .map_err(|err| CliError::failure(anyhow!("failed to read working directory: {err}")))?;
    let sources = ConfigSources {
        env,
        file: cli.config.clone(),
        cli: cli.raw_config(),
        base_dir,
    };
    let config = load(&sources).map_err(|err| CliError::validation(err.describe()))?;
    config
        .validate()
        .map_err(|err| CliError::validation(err.describe()))?;
    Ok(config)
}

fn install_logging(config: &ScannerConfig) {
    let format = match config.logging.style {
        Some(LogStyle::Json) => LogFormat::Json,
        Some(LogStyle::Pretty) => LogFormat::Pretty,
        None => LogFormat::infer(),
    };
    let logging = LoggingConfig {
        level: &config.logging.level,
        format,
        build_sha: build_sha(),
    };
    if let Err(err) = init_logging(&logging) {
        eprintln!("warning: {err}; continuing with the existing subscriber");
    }
}

async fn execute(cli: Cli, env: HashMap<String, String>) -> CliResult<i32> {
    let config = resolve_config(&cli, env)?;
    install_logging(&config);
    config
        .prepare_directories()
        .map_err(|err| CliError::failure(anyhow!(err.describe())))?;

    let metrics = Metrics::new().map_err(|err| CliError::failure(anyhow!("{err}")))?;
    let appliance = HttpAppliance::from_settings(&config.appliance)
        .map_err(|err| CliError::failure(anyhow!(err.describe())))?
        .with_metrics(metrics.clone());
    info!(
        appliance = %appliance.base_url(),
        input = %config.roots.input.display(),
        "tescan starting"
    );

    let orchestrator =
        ScanOrchestrator::new(&config, Arc::new(appliance)).with_metrics(metrics.clone());
    let coordinator = BatchCoordinator::new(&config, orchestrator);

    let shutdown = coordinator.shutdown_flag();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing files in flight");
            shutdown.store(true, Ordering::SeqCst);
        }
    });
    let outcome = coordinator.run().await;
    interrupt.abort();
    let summary = outcome.map_err(|err| CliError::failure(anyhow!(err.describe())))?;

    render_summary(&summary, cli.output, &mut io::stdout().lock())?;

    if let Some(path) = &cli.metrics_file {
        metrics
            .write_textfile(path)
            .map_err(|err| CliError::failure(anyhow!("{err} ({})", path.display())))?;
    }

    Ok(if summary.has_errors() {
        EXIT_FILE_ERRORS
    } else {
        0
    })
}
