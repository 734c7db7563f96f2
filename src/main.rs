mod collectors;
mod config;
mod http;
mod metrics;
mod state;

use axum::serve;
use clap::Parser;
use collectors::command::TokioCommandRunner;
use collectors::{empty_probes, Collector};
use config::Config;
use metrics::Metrics;
use state::{Snapshot, State};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sysmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Collect a single snapshot, print it as JSON and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let collector = Collector::new(&cfg, Arc::new(TokioCommandRunner));

    if cli.once {
        print_once(&collector, &cfg).await;
        return;
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        disk_path = %cfg.disk_path,
        net_interface = %cfg.net_interface,
        "starting sysmond"
    );

    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let collector_task = {
        let metrics = metrics.clone();
        let shared_state = shared_state.clone();
        let mut shutdown = shutdown_rx.clone();
        let interval = cfg.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("stopping collection loop");
                        break;
                    }
                    _ = ticker.tick() => {
                        let snapshot = collector.collect().await;
                        for probe in empty_probes(&snapshot) {
                            metrics.inc_collect_error(probe);
                        }
                        log_summary(&snapshot);

                        let state = {
                            let mut guard = shared_state.write().await;
                            guard.update_collected(now_unix(), snapshot);
                            guard.clone()
                        };
                        metrics.update_from_state(&state);
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("received Ctrl+C, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = collector_task.await;
    let _ = http_task.await;
}

/// The first poll only primes CPU usage counters, so the printed snapshot is the second one.
async fn print_once(collector: &Collector, cfg: &Config) {
    let _ = collector.collect().await;
    tokio::time::sleep(cfg.interval()).await;
    let snapshot = collector.collect().await;

    let collected_at = humantime::format_rfc3339_seconds(SystemTime::now()).to_string();
    let doc = serde_json::json!({
        "collected_at": collected_at,
        "snapshot": snapshot,
    });
    match serde_json::to_string_pretty(&doc) {
        Ok(text) => println!("{text}"),
        Err(err) => {
            error!(error = %err, "failed to serialize snapshot");
            std::process::exit(1);
        }
    }
}

fn log_summary(snapshot: &Snapshot) {
    debug!(
        threads = snapshot.cpu_percents.len(),
        package_temp = ?snapshot.cpu_package_temp,
        memory_percent = ?snapshot.memory.as_ref().map(|m| m.percent),
        upload_kbs = ?snapshot.network.as_ref().map(|n| n.upload_kbs),
        download_kbs = ?snapshot.network.as_ref().map(|n| n.download_kbs),
        "snapshot collected"
    );
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
