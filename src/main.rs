//! Outlier detection simulator.
//!
//! Runs an `OutlierDetectionBalancer` over simulated backends and reports
//! which endpoints are ejected as traffic flows.
//!
//! ```text
//!   TrafficGenerator ──pick──▶ WrappedPicker ──▶ child picker (round_robin)
//!          │                                          │
//!          └──complete(success/failure)──▶ call counters
//!                                                     │
//!   interval timer ──▶ ejection sweep ──▶ wrappers report TRANSIENT_FAILURE
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use outlier_detection::config::loader::load_config;
use outlier_detection::config::watcher::ConfigWatcher;
use outlier_detection::config::SimulatorConfig;
use outlier_detection::lifecycle::{signals, Shutdown};
use outlier_detection::load_balancer::{LbError, ResolverState};
use outlier_detection::observability::{logging, metrics};
use outlier_detection::simulation::{SimulatedController, TrafficGenerator, TrafficStats};
use outlier_detection::{OutlierDetectionBalancer, Registry};

/// Traffic is issued in this many slices per second.
const TICKS_PER_SECOND: u32 = 10;

#[derive(Parser)]
#[command(name = "outlier-sim")]
#[command(about = "Simulate outlier detection over fake backends", long_about = None)]
struct Cli {
    /// Simulator configuration (TOML).
    #[arg(short, long)]
    config: PathBuf,

    /// Stop after this many seconds; runs until Ctrl-C when absent.
    #[arg(short, long)]
    duration_secs: Option<u64>,

    /// Reload the configuration when the file changes.
    #[arg(short, long)]
    watch: bool,
}

fn resolver_state(config: &SimulatorConfig) -> ResolverState {
    ResolverState::new(config.simulation.backends.iter().map(|b| b.address.as_str()))
}

async fn apply(balancer: &OutlierDetectionBalancer, config: &SimulatorConfig) {
    match balancer
        .update_client_conn_state(resolver_state(config), config.outlier_detection.clone())
        .await
    {
        Ok(()) => {}
        Err(LbError::BadResolverState) => {
            tracing::warn!("No backends configured, keeping previous endpoints");
        }
        Err(e) => tracing::error!(error = %e, "Failed to apply configuration"),
    }
}

fn report(balancer: &OutlierDetectionBalancer, stats: &TrafficStats) {
    for endpoint in balancer.endpoint_snapshot() {
        tracing::info!(
            address = %endpoint.address,
            ejected = endpoint.ejected,
            multiplier = endpoint.ejection_time_multiplier,
            rpcs = stats.per_backend.get(&endpoint.address).copied().unwrap_or(0),
            "Endpoint"
        );
    }
    tracing::info!(
        succeeded = stats.succeeded,
        failed = stats.failed,
        pick_errors = stats.pick_errors,
        ejected = balancer.ejected_count(),
        "Traffic report"
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let registry = Registry::with_defaults();
    let mut config = load_config(&cli.config, &registry)?;

    logging::init_logging(&config.observability);
    tracing::info!(config = ?cli.config, "outlier-sim starting");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let controller = Arc::new(SimulatedController::new());
    let balancer = OutlierDetectionBalancer::new(controller.clone(), registry.clone());
    apply(&balancer, &config).await;

    let mut generator = TrafficGenerator::new(controller.clone(), &config.simulation);

    let (mut reloads, _watcher) = if cli.watch {
        let (watcher, rx) = ConfigWatcher::new(&cli.config, registry.clone());
        (Some(rx), Some(watcher.run()?))
    } else {
        (None, None)
    };

    let shutdown = Arc::new(Shutdown::new());
    let mut stop = shutdown.subscribe();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move { signals::shutdown_on_ctrl_c(&signal_shutdown).await });

    let deadline = cli.duration_secs.map(Duration::from_secs);
    let run_for = async {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(run_for);

    let mut traffic_tick =
        tokio::time::interval(Duration::from_secs(1) / TICKS_PER_SECOND);
    let mut report_tick =
        tokio::time::interval(Duration::from_millis(config.simulation.report_interval_ms.max(1)));
    let mut stats = TrafficStats::default();

    loop {
        tokio::select! {
            _ = traffic_tick.tick() => {
                let per_tick = config.simulation.requests_per_second.div_ceil(TICKS_PER_SECOND);
                stats.merge(generator.send_batch(per_tick));
            }
            _ = report_tick.tick() => {
                report(&balancer, &stats);
                stats = TrafficStats::default();
            }
            Some(new_config) = async {
                match reloads.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                tracing::info!("Applying reloaded configuration");
                generator.update_backends(&new_config.simulation);
                apply(&balancer, &new_config).await;
                config = new_config;
            }
            _ = &mut run_for => {
                tracing::info!("Simulation duration elapsed");
                break;
            }
            _ = stop.recv() => break,
        }
    }

    shutdown.trigger();
    report(&balancer, &stats);
    balancer.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
