//! tg-attacher - attach instance IPs to load-balancer target groups
//!
//! ## Usage
//!
//! ```bash
//! # Follow a watch feed on stdin
//! kube-watch-to-ndjson | tg-attacher --region us-west-2
//!
//! # Replay a recorded feed, four workers, hourly drift sweep
//! tg-attacher --events pods.ndjson --workers 4 --drift-interval-secs 3600
//!
//! # JSON logs, debug for the attacher only
//! RUST_LOG=tg_attacher=debug tg-attacher --log-format json
//! ```

use anyhow::Context;
use aws_types::region::Region;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tg_attacher::{
    AttacherConfig, ElbBackend, ExponentialBackoff, SelectionFilter, controller, ndjson_notifications,
};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// tg-attacher: keep load-balancer target groups in step with instances
#[derive(Parser)]
#[command(name = "tg-attacher")]
#[command(about = "Register annotated instance IPs with ELBv2 target groups", long_about = None)]
struct Cli {
    /// AWS region (default: from the environment)
    #[arg(long)]
    region: Option<String>,

    /// Notification feed, one JSON object per line ("-" for stdin)
    #[arg(long, default_value = "-")]
    events: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Annotation holding target-group memberships
    #[arg(long, default_value = tg_attacher::DEFAULT_ANNOTATION_KEY)]
    annotation_key: String,

    /// Label selecting instances (value must be "true")
    #[arg(long, default_value = tg_attacher::DEFAULT_ENABLE_LABEL)]
    enable_label: String,

    /// Only observe instances in this namespace
    #[arg(long)]
    namespace: Option<String>,

    /// Reconciliation workers
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Retries before an item is dropped
    #[arg(long, default_value_t = tg_attacher::queue::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Initial retry backoff (milliseconds)
    #[arg(long, default_value_t = 5)]
    backoff_base_ms: u64,

    /// Maximum retry backoff (seconds)
    #[arg(long, default_value_t = 1000)]
    backoff_cap_secs: u64,

    /// Skip instances created before startup
    #[arg(long)]
    only_new_instances: bool,

    /// Drift correction interval (seconds, omit to disable)
    #[arg(long)]
    drift_interval_secs: Option<u64>,

    /// Target group the drift sweep may touch (repeatable, default: all referenced)
    #[arg(long = "drift-target-group")]
    drift_target_groups: Vec<String>,

    /// Timeout for a single ELB call (seconds)
    #[arg(long, default_value_t = 30)]
    call_timeout_secs: u64,

    /// How long delete tombstones are kept (seconds)
    #[arg(long, default_value_t = 3600)]
    tombstone_ttl_secs: u64,
}

impl Cli {
    fn config(&self) -> AttacherConfig {
        AttacherConfig {
            annotation_key: self.annotation_key.clone(),
            enable_label: self.enable_label.clone(),
            namespace: self.namespace.clone(),
            workers: self.workers,
            max_retries: self.max_retries,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_secs(self.backoff_cap_secs),
            ),
            only_new_instances: self.only_new_instances,
            drift_interval: self.drift_interval_secs.map(Duration::from_secs),
            drift_target_groups: self.drift_target_groups.clone(),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            tombstone_ttl: Duration::from_secs(self.tombstone_ttl_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tg_attacher=info,info".into());
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    let config = cli.config();
    config.validate()?;

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = cli.region.clone() {
        loader = loader.region(Region::new(region));
    }
    let aws_config = loader.load().await;
    let backend = Arc::new(ElbBackend::from_config(&aws_config));

    let filter = SelectionFilter::new(config.enable_label.clone()).with_namespace(config.namespace.clone());
    let notifications = if cli.events == "-" {
        info!("Reading notifications from stdin");
        ndjson_notifications(BufReader::new(tokio::io::stdin()), filter)
    } else {
        let file = tokio::fs::File::open(&cli.events)
            .await
            .with_context(|| format!("failed to open {}", cli.events))?;
        info!(path = %cli.events, "Reading notifications from file");
        ndjson_notifications(BufReader::new(file), filter)
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    info!(
        annotation_key = %config.annotation_key,
        enable_label = %config.enable_label,
        workers = config.workers,
        "Starting tg-attacher"
    );
    controller::run(&config, backend, notifications, cancel).await?;

    Ok(())
}

/// Cancel on Ctrl+C or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    cancel.cancel();
}
