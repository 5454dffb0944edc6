//! mlat-server: network server + offline replay for Mode S
//! multilateration.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mlat_core::config::MlatParams;

mod engine;
mod ingest;
mod output;
mod replay;
mod settings;
mod status;

use engine::Engine;
use ingest::SharedEngine;
use output::{FeedDispatcher, WebhookDispatcher};

#[derive(Parser)]
#[command(name = "mlat", version, about = "Mode S multilateration server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live server: receiver ingest, status API, position feed
    Serve {
        /// Config file path (default ~/.mlat-server/config.yaml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Receiver ingest bind address (overrides config)
        #[arg(long)]
        ingest: Option<String>,

        /// Status API bind address (overrides config)
        #[arg(long)]
        status: Option<String>,

        /// Position feed bind address (overrides config)
        #[arg(long)]
        feed: Option<String>,

        /// Webhook URL POSTed per accepted fix (overrides config)
        #[arg(long)]
        webhook: Option<String>,
    },

    /// Replay a multi-receiver capture file and print a summary
    Replay {
        /// Path to the capture file
        file: PathBuf,

        /// Write accepted fixes as JSON lines to this path
        #[arg(long)]
        fixes: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            ingest,
            status,
            feed,
            webhook,
        } => cmd_serve(config, ingest, status, feed, webhook).await,
        Commands::Replay { file, fixes } => cmd_replay(file, fixes),
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

async fn cmd_serve(
    config: Option<PathBuf>,
    ingest_override: Option<String>,
    status_override: Option<String>,
    feed_override: Option<String>,
    webhook_override: Option<String>,
) {
    let path = config.unwrap_or_else(settings::config_file);
    let mut cfg = settings::load_settings(&path);
    if let Some(v) = ingest_override {
        cfg.ingest = v;
    }
    if let Some(v) = status_override {
        cfg.status = v;
    }
    if let Some(v) = feed_override {
        cfg.feed = v;
    }
    if let Some(v) = webhook_override {
        cfg.webhook = Some(v);
    }

    let mut params = MlatParams::default();
    cfg.apply(&mut params);

    let engine: SharedEngine = Arc::new(Mutex::new(Engine::new(params)));
    let feed = FeedDispatcher::new();
    let webhook = cfg.webhook.as_deref().map(WebhookDispatcher::new);

    // Receiver ingest
    let ingest_listener = match tokio::net::TcpListener::bind(&cfg.ingest).await {
        Ok(l) => l,
        Err(e) => {
            error!(bind = %cfg.ingest, error = %e, "cannot bind ingest");
            std::process::exit(1);
        }
    };
    info!(bind = %cfg.ingest, "receiver ingest listening");
    tokio::spawn(ingest::run(ingest_listener, engine.clone()));

    // Status API
    let status_listener = match tokio::net::TcpListener::bind(&cfg.status).await {
        Ok(l) => l,
        Err(e) => {
            error!(bind = %cfg.status, error = %e, "cannot bind status API");
            std::process::exit(1);
        }
    };
    info!(bind = %cfg.status, "status API listening");
    let router = status::build_router(engine.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(status_listener, router).await {
            error!(error = %e, "status API failed");
        }
    });

    // Position feed
    let feed_listener = match tokio::net::TcpListener::bind(&cfg.feed).await {
        Ok(l) => l,
        Err(e) => {
            error!(bind = %cfg.feed, error = %e, "cannot bind feed");
            std::process::exit(1);
        }
    };
    info!(bind = %cfg.feed, "position feed listening");
    let feed_server = feed.clone();
    tokio::spawn(async move { feed_server.serve(feed_listener).await });

    // Housekeeping drives group closure, solving, and eviction
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        ticker.tick().await;
        let fixes = engine.lock().unwrap().housekeeping(now());
        for fix in &fixes {
            feed.publish(fix);
            if let Some(wh) = &webhook {
                wh.notify(fix);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

fn cmd_replay(file: PathBuf, fixes_out: Option<PathBuf>) {
    let (engine, summary) = match replay::run_replay(&file, MlatParams::default()) {
        Ok(r) => r,
        Err(e) => {
            error!(file = %file.display(), error = %e, "replay failed");
            std::process::exit(1);
        }
    };

    replay::print_summary(&engine, &summary);

    let result = match fixes_out {
        Some(path) => std::fs::File::create(&path)
            .map_err(mlat_core::types::MlatError::Io)
            .and_then(|mut f| replay::write_fixes(&summary.fixes, &mut f)),
        None => replay::write_fixes(&summary.fixes, &mut std::io::stdout()),
    };
    if let Err(e) = result {
        error!(error = %e, "writing fixes failed");
        std::process::exit(1);
    }
}
