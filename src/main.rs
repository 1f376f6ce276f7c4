//! CLI entry point for the trip monitor.
//!
//! Provides subcommands for running the monitoring loop against the trip API,
//! replaying a simulated trip through the engine, and checking a single point
//! against a route.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{Instrument, info, info_span};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use trip_monitor::{
    config::{MonitorConfig, OverridesFile},
    fetch::{
        BasicClient,
        auth::{ApiKey, UrlParam},
    },
    geometry::distance_to_route,
    model::Waypoint,
    monitor::Monitor,
    output::print_json,
    parser::parse_route,
    scheduler::Scheduler,
    simulate::{SimulationMode, SimulationOptions, run_simulation},
    sink::{CsvAlertSink, JsonDirStateRepository},
    source::{HttpTripSource, TripSource},
};

#[derive(Parser)]
#[command(name = "trip_monitor")]
#[command(about = "Route deviation and stop monitoring for in-progress trips", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor every in-progress trip served by the trip API
    Run {
        /// Base URL of the trip API
        #[arg(long, env = "MONITOR_API_URL")]
        api_url: String,

        /// Token sent as `Authorization: Bearer <token>`
        #[arg(long, env = "MONITOR_API_TOKEN", hide_env_values = true)]
        api_token: Option<String>,

        /// Send the token as this query parameter instead of a header
        #[arg(long, requires = "api_token")]
        api_key_param: Option<String>,

        /// JSON file with per-trip and per-route threshold overrides
        #[arg(long)]
        overrides: Option<String>,

        /// CSV file to append alerts to
        #[arg(long, default_value = "alerts.csv")]
        alerts_csv: String,

        /// Directory holding the persisted per-trip state
        #[arg(long, default_value = "state")]
        state_dir: String,

        /// Optional CSV file to append per-tick statistics to
        #[arg(long)]
        stats_output: Option<String>,

        /// Seconds between ticks (overrides MONITOR_TICK_SECS)
        #[arg(long)]
        tick_secs: Option<u64>,

        /// Maximum trips evaluated concurrently (overrides MONITOR_CONCURRENCY)
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Number of ticks to run (0 = until Ctrl+C)
        #[arg(short = 'n', long, default_value_t = 0)]
        num_ticks: u64,

        /// Log every fleet event as JSON
        #[arg(long, default_value_t = false)]
        log_events: bool,
    },
    /// Replay a synthetic trip along a route through the engine
    Simulate {
        /// Route file (GeoJSON LineString/Feature or waypoint list)
        #[arg(value_name = "ROUTE_FILE")]
        route: String,

        #[arg(short, long, value_enum, default_value_t = SimulationMode::Route)]
        mode: SimulationMode,

        /// Simulated speed in km/h
        #[arg(short, long, default_value_t = 60.0)]
        speed: f64,

        /// Seconds between samples
        #[arg(short, long, default_value_t = 30)]
        interval: i64,

        /// Simulated duration in seconds
        #[arg(short, long, default_value_t = 1800)]
        duration: i64,

        /// Inject a ten-minute-old sample halfway through
        #[arg(long, default_value_t = false)]
        inject_old: bool,

        /// Deviation tolerance in meters
        #[arg(short, long)]
        tolerance: Option<f64>,
    },
    /// Print the distance from a point to a route
    CheckRoute {
        #[arg(value_name = "ROUTE_FILE")]
        route: String,

        #[arg(allow_negative_numbers = true)]
        latitude: f64,

        #[arg(allow_negative_numbers = true)]
        longitude: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/trip_monitor.log".to_string());
    let log_dir = Path::new(&log_file_path).parent().unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("trip_monitor.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry().with(stderr_layer).with(json_layer).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            api_url,
            api_token,
            api_key_param,
            overrides,
            alerts_csv,
            state_dir,
            stats_output,
            tick_secs,
            concurrency,
            num_ticks,
            log_events,
        } => {
            let mut config = MonitorConfig::from_env()?;
            if let Some(secs) = tick_secs {
                config.tick_interval = Duration::from_secs(secs);
            }
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(path) = &overrides {
                config.overrides = OverridesFile::load(path)
                    .with_context(|| format!("loading threshold overrides from {path}"))?;
            }
            config.validate()?;

            let source = trip_source(&api_url, api_token.as_deref(), api_key_param)?;
            let monitor = Monitor::new(
                source,
                Arc::new(CsvAlertSink::new(alerts_csv)),
                Arc::new(JsonDirStateRepository::new(state_dir)),
                config,
            );
            monitor.restore().await?;

            let monitor = Arc::new(monitor);
            if log_events {
                spawn_event_logger(Arc::clone(&monitor)).await;
            }

            let mut scheduler = Scheduler::new(monitor);
            if let Some(path) = stats_output {
                scheduler = scheduler.with_stats_output(path);
            }

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            };
            scheduler.run(num_ticks, shutdown).await;
        }
        Commands::Simulate { route, mode, speed, interval, duration, inject_old, tolerance } => {
            let route = read_route(&route)?;
            let mut config = MonitorConfig::from_env()?;
            if let Some(tolerance) = tolerance {
                config.thresholds.tolerance_meters = tolerance;
            }
            config.validate()?;

            let options = SimulationOptions {
                mode,
                speed_kmh: speed,
                interval: chrono::Duration::seconds(interval),
                duration: chrono::Duration::seconds(duration),
                inject_old,
                start: chrono::Utc::now(),
            };
            let report = run_simulation(route, options, config).await?;
            print_json(&report)?;
        }
        Commands::CheckRoute { route, latitude, longitude } => {
            let route = read_route(&route)?;
            let distance = distance_to_route(Waypoint::new(latitude, longitude), &route.waypoints)?;
            let tolerance = MonitorConfig::from_env()?.thresholds.tolerance_meters;
            print_json(&json!({
                "route_id": route.id,
                "distance_meters": distance.distance_meters,
                "segment_index": distance.segment_index,
                "tolerance_meters": tolerance,
                "deviated": distance.distance_meters > tolerance,
            }))?;
        }
    }

    Ok(())
}

/// Builds the HTTP trip source with whichever authentication was configured.
fn trip_source(
    api_url: &str,
    api_token: Option<&str>,
    api_key_param: Option<String>,
) -> Result<Arc<dyn TripSource>> {
    let client = BasicClient::new()?;
    let source: Arc<dyn TripSource> = match (api_token, api_key_param) {
        (Some(token), Some(param_name)) => Arc::new(HttpTripSource::new(
            UrlParam { inner: client, param_name, key: token.to_string() },
            api_url,
        )),
        (Some(token), None) => {
            Arc::new(HttpTripSource::new(ApiKey::bearer(client, token)?, api_url))
        }
        (None, _) => Arc::new(HttpTripSource::new(client, api_url)),
    };
    info!(api_url, authenticated = api_token.is_some(), "Trip source configured");
    Ok(source)
}

#[tracing::instrument]
fn read_route(path: &str) -> Result<trip_monitor::model::Route> {
    let bytes = std::fs::read(path).with_context(|| format!("reading route file {path}"))?;
    parse_route(&bytes).with_context(|| format!("parsing route file {path}"))
}

/// Logs every fleet event as JSON until the subscription closes.
async fn spawn_event_logger(monitor: Arc<Monitor>) {
    let mut subscription = monitor.subscribe_fleet().await;
    tokio::spawn(
        async move {
            while let Some(event) = subscription.recv().await {
                if let Err(e) = print_json(&*event) {
                    tracing::warn!(error = %e, "Failed to serialize event");
                }
            }
        }
        .instrument(info_span!("event_logger")),
    );
}
