// =============================================================================
// kline-sentry — Main Entry Point
// =============================================================================
//
// Wires configuration, persistence, venue adapters, the history/detector
// pipeline, and the Query Facade together, then serves until a ctrl-c signal
// drains everything in order: Pollers -> Detector -> SessionRegistry ->
// QueryFacade (§5/§9). Grounded on `original_source/Src/main.cpp`'s startup
// sequence and exit-code table.

mod api;
mod app_state;
mod config;
mod detector;
mod error;
mod fetcher;
mod filter;
mod history;
mod persistence;
mod poller;
mod session;
mod types;
mod venues;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::detector::Detector;
use crate::error::ExitCode;
use crate::persistence::{run_flush_loop, InMemoryUserStore, SqliteUserStore, UserStore};
use crate::types::KLineInterval;
use crate::venues::{BinanceAdapter, BybitAdapter, DynVenueAdapter, MoexAdapter, VenueAdapter};

#[derive(Parser, Debug)]
#[command(name = "kline-sentry", version, about = "Multi-venue kline anomaly detector")]
struct Cli {
    /// Path to the INI configuration file.
    #[arg(long, default_value = "config.ini")]
    config: String,

    /// Write a commented config template to --config's path and exit.
    #[arg(long)]
    makeconfig: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .is_err()
    {
        ExitCode::StartLoggerErr.exit();
    }

    if cli.makeconfig {
        match config::make_config_template(&cli.config) {
            Ok(()) => std::process::exit(ExitCode::Ok as i32),
            Err(e) => {
                error!(error = %e, "failed to write config template");
                ExitCode::LoadConfigErr.exit();
            }
        }
    }

    let app_config = match AppConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            ExitCode::LoadConfigErr.exit();
        }
    };

    let users: Box<dyn UserStore> = if app_config.database.url.is_empty() {
        Box::new(InMemoryUserStore::new())
    } else {
        match SqliteUserStore::connect(&app_config.database.url).await {
            Ok(store) => Box::new(store),
            Err(e) => {
                error!(error = %e, "failed to connect to user database");
                ExitCode::SqlNotConnect.exit();
            }
        }
    };

    // Users are loaded once at startup (§3); a failure here is fatal,
    // matching the original's `errorOccurred(EXIT_CODE::SQL_NOT_CONNECT, ...)`
    // in `usersdata.cpp`'s `loadUserData()`.
    let loaded_users = match users.load_all().await {
        Ok(u) => u,
        Err(e) => {
            error!(error = %e, "failed to load user table");
            ExitCode::SqlNotConnect.exit();
        }
    };
    info!(count = loaded_users.len(), "user table loaded");

    let adapters = match build_adapters(&app_config) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "failed to build venue adapters");
            ExitCode::ServiceInitErr.exit();
        }
    };

    let (state, candle_rx) = match AppState::new(&app_config, users, adapters) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "failed to initialize application state");
            ExitCode::ServiceInitErr.exit();
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);

    // Discovery/reconciliation loop per adapter: re-discover every 10 minutes,
    // retry every 60s on a discovery failure (§4.A.1).
    let mut discovery_tasks = Vec::new();
    for handle in state.adapters.clone() {
        let state = state.clone();
        let mut stop = stop_rx.clone();
        discovery_tasks.push(tokio::spawn(async move {
            loop {
                let discovered = handle.adapter.discover_instruments(&state.fetcher, &handle.symbol_prefixes).await;
                let sleep_for = match discovered {
                    Ok(instruments) => {
                        info!(venue = handle.adapter.venue_id(), count = instruments.len(), "instruments discovered");
                        state.reconcile_adapter(&handle, instruments);
                        std::time::Duration::from_secs(10 * 60)
                    }
                    Err(e) => {
                        error!(venue = handle.adapter.venue_id(), error = %e, "instrument discovery failed");
                        std::time::Duration::from_secs(60)
                    }
                };
                tokio::select! {
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
        }));
    }

    let detector = Arc::new(Detector::new(state.history.clone(), state.sessions.clone()));
    let detector_task = tokio::spawn(detector.run(candle_rx));

    let background_task = tokio::spawn(state.clone().run_background_tasks(stop_rx.clone()));

    let flush_sessions = state.sessions.clone();
    let flush_task = tokio::spawn(async move {
        run_flush_loop(flush_sessions.users_store(), || flush_sessions.dirty_snapshot()).await;
    });

    let addr = format!("{}:{}", app_config.server.address, app_config.server.port);
    let router = api::router(state.clone());
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr, "failed to bind HTTP listener");
            ExitCode::HttpServerNotListen.exit();
        }
    };
    info!(addr, "kline-sentry listening");

    let serve = axum::serve(listener, router.into_make_service_with_connect_info::<std::net::SocketAddr>());

    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Drain order: Pollers -> Detector -> SessionRegistry -> QueryFacade (§5/§9).
    let _ = stop_tx.send(true);
    for handle in &state.adapters {
        for entry in handle.pollers.iter() {
            let _ = entry.value().stop_tx.send(true);
        }
    }
    for task in discovery_tasks {
        task.abort();
    }
    // The detector's channel never naturally closes (AppState keeps a
    // sender alive), so it is drained by abort rather than awaited.
    detector_task.abort();
    let _ = background_task.await;
    flush_task.abort();
    info!("kline-sentry shut down cleanly");
}

fn build_adapters(
    config: &AppConfig,
) -> anyhow::Result<Vec<(DynVenueAdapter, Vec<KLineInterval>, Vec<String>)>> {
    let mut out = Vec::new();
    for exchange in &config.stock_exchanges {
        let adapter: DynVenueAdapter = match exchange.venue_type.as_str() {
            "Binance" => Arc::new(BinanceAdapter::new()),
            "Bybit" => Arc::new(BybitAdapter::new()),
            "Moex" => Arc::new(MoexAdapter::default()),
            other => anyhow::bail!("unknown venue type '{other}'"),
        };
        out.push((adapter, exchange.kline_intervals.clone(), exchange.symbol_prefixes.clone()));
    }
    Ok(out)
}
