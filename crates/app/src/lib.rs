use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use pixlift_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use pixlift_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use pixlift_core::models::{ModelResolver, ScaleFactor};
use pixlift_core::server::{app_router, AppState};

#[derive(Parser)]
#[command(
    name = "pixlift",
    about = "Real-ESRGAN based image enhancement service",
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
    /// Pre-download model weights so the first request doesn't pay for them
    Fetch(FetchArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(help = "Scale to fetch (2, 4, or 8); omit to fetch all")]
    scale: Option<u32>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Some(Commands::Fetch(fetch)) => run_fetch(fetch.scale, resolved_data_dir),
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let env_filter = parse_env_filter_with_fallback(&init_plan.filter, "console");

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let file_env_filter = parse_env_filter_with_fallback(&init_plan.filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %fallback.reason,
                "Persistent file logging unavailable; continuing with console-only logging"
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

fn log_startup_metadata(data_dir: &Path) {
    let pid = std::process::id();
    let cfg_path = config_path(data_dir);
    info!(
        pid,
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    let cfg_path = config_path(data_dir);
    match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());
    let weights_dir = resolve_relative_to(&data_dir, &config.paths.weights_dir);

    let state = AppState::new(config, weights_dir);
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting pixlift server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn run_fetch(scale: Option<u32>, data_dir: PathBuf) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = load_config(&data_dir);
    let weights_dir = resolve_relative_to(&data_dir, &config.paths.weights_dir);
    let resolver = ModelResolver::new(weights_dir);

    let scales: Vec<ScaleFactor> = match scale {
        Some(value) => vec![ScaleFactor::try_from(value)?],
        None => ScaleFactor::ALL.to_vec(),
    };

    for scale in scales {
        if resolver.is_cached(scale) {
            info!(%scale, path = %resolver.local_path(scale).display(), "Weights already cached");
            continue;
        }
        let path = resolver
            .resolve(scale)
            .with_context(|| format!("failed to fetch weights for scale {scale}"))?;
        info!(%scale, path = %path.display(), "Weights fetched");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_server_flags() {
        let cli = Cli::try_parse_from([
            "pixlift",
            "--port",
            "9000",
            "--host",
            "127.0.0.1",
            "-vv",
            "--data-dir",
            "/tmp/pixlift-data",
        ])
        .unwrap();

        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/pixlift-data")));
    }

    #[test]
    fn cli_parses_fetch_subcommand() {
        let cli = Cli::try_parse_from(["pixlift", "fetch", "4"]).unwrap();
        match cli.command {
            Some(Commands::Fetch(fetch)) => assert_eq!(fetch.scale, Some(4)),
            _ => panic!("expected fetch subcommand"),
        }

        let cli = Cli::try_parse_from(["pixlift", "fetch"]).unwrap();
        match cli.command {
            Some(Commands::Fetch(fetch)) => assert_eq!(fetch.scale, None),
            _ => panic!("expected fetch subcommand"),
        }
    }

    #[test]
    fn cli_rejects_server_flags_with_subcommand() {
        // args_conflicts_with_subcommands: server flags and `fetch` are
        // mutually exclusive.
        assert!(Cli::try_parse_from(["pixlift", "--port", "9000", "fetch"]).is_err());
    }
}
