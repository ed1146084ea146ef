//! ConvertPulse agent — headless event shipper.
//!
//! Embeds the tracker, reads newline-delimited JSON events from stdin, and
//! forwards them through the live channel or the HTTP batch path.

use std::sync::Arc;

use clap::Parser;
use pulse_core::config::TrackerConfig;
use pulse_fingerprint::{DeviceProfile, StaticEnvironment};
use pulse_tracker::Tracker;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pulse-agent")]
#[command(about = "Headless ConvertPulse event shipper")]
#[command(version)]
struct Cli {
    /// Collection endpoint (overrides config)
    #[arg(long, env = "CONVERT_PULSE__API_URL")]
    api_url: Option<String>,

    /// Project identifier (overrides config)
    #[arg(long, env = "CONVERT_PULSE__PROJECT_ID")]
    project_id: Option<String>,

    /// Live WebSocket endpoint (overrides config)
    #[arg(long, env = "CONVERT_PULSE__WEBSOCKET__URL")]
    ws_url: Option<String>,

    /// Durable storage directory (overrides config)
    #[arg(long, env = "CONVERT_PULSE__STORAGE__NAMESPACE_DIR")]
    storage_dir: Option<String>,

    /// Logical page URL reported for this agent's events
    #[arg(long, default_value = "app://pulse-agent/")]
    page_url: String,

    /// Skip the live channel even when a WebSocket URL is configured
    #[arg(long, default_value_t = false)]
    batch_only: bool,
}

/// One stdin line: either a page view marker or a named event.
#[derive(Debug, serde::Deserialize)]
struct InputEvent {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    pageview: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_agent=info,pulse_tracker=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("ConvertPulse agent starting up");

    let mut config = TrackerConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        TrackerConfig::default()
    });

    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    if let Some(project_id) = cli.project_id {
        config.project_id = project_id;
    }
    if let Some(ws_url) = cli.ws_url {
        config.websocket.url = Some(ws_url);
    }
    if let Some(dir) = cli.storage_dir {
        config.storage.namespace_dir = Some(dir);
    }
    if cli.batch_only {
        config.websocket.url = None;
    }

    info!(
        api_url = %config.api_url,
        project_id = %config.project_id,
        live_channel = config.websocket.url.is_some(),
        "Configuration loaded"
    );

    let env = Arc::new(
        StaticEnvironment::new()
            .with_device(DeviceProfile {
                platform: std::env::consts::OS.to_string(),
                browser: "pulse-agent".to_string(),
                browser_version: env!("CARGO_PKG_VERSION").to_string(),
                user_agent: format!("pulse-agent/{}", env!("CARGO_PKG_VERSION")),
                ..DeviceProfile::default()
            })
            .with_page(pulse_core::events::PageContext {
                url: cli.page_url,
                title: "pulse-agent".to_string(),
                referrer: None,
            }),
    );

    let tracker = Tracker::new(config, env)?;
    tracker.init().await;

    // Periodic storage maintenance, like any embedding host should run.
    let store = tracker.store();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tick.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged, "storage maintenance complete");
            }
        }
    });

    tracker.page_view(None).await;
    info!("Agent ready, reading events from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shipped: u64 = 0;
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<InputEvent>(&line) {
            Ok(input) if input.pageview => {
                tracker.page_view(input.data).await;
                shipped += 1;
            }
            Ok(InputEvent {
                event: Some(name),
                data,
                ..
            }) => {
                tracker.track(&name, data);
                shipped += 1;
            }
            Ok(_) => warn!(line = %line, "input line has neither event nor pageview"),
            Err(e) => warn!(error = %e, "skipping undecodable input line"),
        }
    }

    info!(shipped, "stdin closed, flushing and shutting down");
    if let Err(e) = tracker.flush().await {
        warn!(error = %e, "final flush failed, events remain queued");
    }
    tracker.destroy().await;

    Ok(())
}
