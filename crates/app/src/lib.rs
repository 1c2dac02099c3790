use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use pdf2word_core::batch::ConversionPipeline;
use pdf2word_core::bundle::ConversionPayload;
use pdf2word_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_port, resolve_relative_to, AppConfig,
};
use pdf2word_core::error::PipelineError;
use pdf2word_core::job::JobRegistry;
use pdf2word_core::logging::{self, CrashHook, FileSink, LoggingOptions, DEFAULT_LOG_FILTER};
use pdf2word_core::server::{app_router, AppState};
use pdf2word_core::upload::UploadedFile;
use pdf2word_core::workspace::{ensure_work_dir, prepare_work_dir};

#[derive(Parser)]
#[command(
    name = "pdf2word",
    about = "PDF to Word conversion server",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the interpreter, conversion library and script, then exit.
    Check,
    /// Convert local PDF files without starting the server.
    Convert(ConvertArgs),
}

#[derive(Args)]
struct ConvertArgs {
    #[arg(required = true, help = "PDF files to convert")]
    inputs: Vec<PathBuf>,
    #[arg(
        short = 'o',
        long,
        help = "Output file or directory (default: next to the first input)"
    )]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Server,
    Check,
    Convert,
}

impl RunMode {
    fn name(self) -> &'static str {
        match self {
            RunMode::Server => "server",
            RunMode::Check => "check",
            RunMode::Convert => "convert",
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match &cli.command {
        None => RunMode::Server,
        Some(Commands::Check) => RunMode::Check,
        Some(Commands::Convert(_)) => RunMode::Convert,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir)?;

    match cli.command {
        Some(Commands::Check) => run_check(config).await,
        Some(Commands::Convert(args)) => run_convert(config, args.inputs, args.output).await,
        None => run_server(config, cli.port, cli.host).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_crash_hook(data_dir);
    if let CrashHook::Disabled { reason } = &crash_hook {
        eprintln!("Warning: crash reports unavailable ({reason}). Panics will not be persisted.");
    }

    let options = LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let plan = logging::plan_logging(&options);
    let console_filter = parse_env_filter_with_fallback(&plan.filters.console, "console");

    match plan.file_sink {
        FileSink::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&plan.filters.file, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_filter),
                );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
            }
        }
        FileSink::Disabled {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}.");
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "File logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RunMode, data_dir: &Path) {
    info!(
        mode = mode.name(),
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Loads `config.toml` from the data directory (writing defaults on first
/// run) and resolves its relative paths against the working directory.
fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    Ok(config.with_paths_resolved(&cwd))
}

async fn run_server(
    config: AppConfig,
    port_override: Option<u16>,
    host_override: Option<String>,
) -> Result<()> {
    prepare_work_dir(&config.paths.work_dir)?;

    let port = resolve_port(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        &config.server,
    );
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let shutdown = CancellationToken::new();
    let state = AppState::new(config, shutdown.clone());

    match state.pipeline().check_environment().await {
        Ok(report) => info!(
            interpreter = %report.interpreter_path.display(),
            version = %report.version,
            library = %report.library,
            library_version = report.library_version.as_deref().unwrap_or("unknown"),
            "Conversion environment ready"
        ),
        Err(err) => warn!(
            error = %err,
            "Conversion environment unavailable; conversions will fail until it is fixed"
        ),
    }

    match &state.config().paths.static_dir {
        Some(dir) => info!(static_dir = %dir.display(), "Serving client page from disk"),
        None => info!("Serving embedded client page"),
    }

    let app = app_router(state);
    let addr = format!("{host}:{port}");
    info!(%addr, "Starting pdf2word server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested; stopping in-flight conversions");
    shutdown.cancel();
}

async fn run_check(config: AppConfig) -> Result<()> {
    let pipeline = ConversionPipeline::new(&config, JobRegistry::new(), CancellationToken::new());
    let report = pipeline.check_environment().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_convert(config: AppConfig, inputs: Vec<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    ensure_work_dir(&config.paths.work_dir)?;

    let mut files = Vec::with_capacity(inputs.len());
    for input in &inputs {
        let bytes = tokio::fs::read(input)
            .await
            .with_context(|| format!("failed to read {}", input.display()))?;
        files.push(UploadedFile::new(&input.to_string_lossy(), bytes));
    }

    let pipeline = ConversionPipeline::new(&config, JobRegistry::new(), CancellationToken::new());
    let payload = match pipeline.process(files).await {
        Ok(payload) => payload,
        Err(PipelineError::BatchFailed { outcomes }) => {
            for outcome in &outcomes {
                warn!(
                    file = %outcome.file,
                    error = outcome.error.as_deref().unwrap_or("unknown error"),
                    "Conversion failed"
                );
            }
            bail!("all {} conversions failed", outcomes.len());
        }
        Err(err) => return Err(err.into()),
    };

    let target = resolve_output_path(output.as_deref(), &inputs, payload.file_name())?;
    let (bytes, summary) = match payload {
        ConversionPayload::Document { bytes, .. } => (bytes, "converted 1 file".to_string()),
        ConversionPayload::Archive {
            bytes,
            converted,
            failed,
            ..
        } => (bytes, format!("converted {converted} file(s), {failed} failed")),
    };
    tokio::fs::write(&target, bytes)
        .await
        .with_context(|| format!("failed to write {}", target.display()))?;

    info!(output = %target.display(), "Conversion output written");
    println!("{summary}: {}", target.display());
    Ok(())
}

/// `-o` may name a file or an existing directory; without it the result
/// lands next to the first input.
fn resolve_output_path(output: Option<&Path>, inputs: &[PathBuf], file_name: &str) -> Result<PathBuf> {
    match output {
        Some(path) if path.is_dir() => Ok(path.join(file_name)),
        Some(path) => Ok(path.to_path_buf()),
        None => {
            let Some(first) = inputs.first() else {
                bail!("no input files given");
            };
            let dir = first
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            Ok(resolve_relative_to(dir, Path::new(file_name)))
        }
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["pdf2word", "--port", "8080", "-v"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.verbose, 1);
    }

    #[test]
    fn convert_takes_inputs_and_output() {
        let cli = Cli::try_parse_from(["pdf2word", "convert", "a.pdf", "b.pdf", "-o", "out"]).unwrap();
        match cli.command {
            Some(Commands::Convert(args)) => {
                assert_eq!(args.inputs, [PathBuf::from("a.pdf"), PathBuf::from("b.pdf")]);
                assert_eq!(args.output, Some(PathBuf::from("out")));
            }
            _ => panic!("expected convert subcommand"),
        }
    }

    #[test]
    fn convert_requires_an_input() {
        assert!(Cli::try_parse_from(["pdf2word", "convert"]).is_err());
    }

    #[test]
    fn check_accepts_global_flags() {
        let cli = Cli::try_parse_from(["pdf2word", "check", "--log-filter", "debug", "--data-dir", "/srv"])
            .unwrap();
        assert!(matches!(cli.command, Some(Commands::Check)));
        assert_eq!(cli.log_filter.as_deref(), Some("debug"));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/srv")));
    }
}



#[cfg(test)]
mod log_filter_tests {
    use pdf2word_core::logging::{compose_filters, LoggingOptions, DEFAULT_QUIET_FILTER};

    fn console_filter(rust_log: Option<&str>, verbose: u8, cli: Option<&str>) -> String {
        compose_filters(&LoggingOptions {
            rust_log_env: rust_log.map(ToString::to_string),
            verbose,
            cli_log_filter: cli.map(ToString::to_string),
            ..Default::default()
        })
        .console
    }

    #[test]
    fn default_is_quiet_filter_plus_info() {
        assert_eq!(
            console_filter(None, 0, None),
            format!("{DEFAULT_QUIET_FILTER},info")
        );
    }

    #[test]
    fn verbose_and_explicit_filters_drop_quiet_directives() {
        assert_eq!(console_filter(Some("warn"), 1, None), "debug");
        assert_eq!(console_filter(Some("warn"), 0, Some("pdf2word_core=trace")), "pdf2word_core=trace");
    }
}
