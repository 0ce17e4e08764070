// # netsyncd - Provisioning Reconciler Daemon
//
// The netsyncd daemon is a thin integration layer over netsync-core. It is
// responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing tracing and the runtime
// 3. Creating the store and device driver through the plugin registry
// 4. Running the sync reconciler until SIGTERM/SIGINT
//
// Subnet, pool and service operations are driven by the CRUD layer that
// embeds netsync-core; the daemon only reconciles.
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Store
// - `NETSYNC_STORE_TYPE`: Type of store (file, memory). Default: file
// - `NETSYNC_STORE_PATH`: Path to state file (for file store)
//
// ### Device Driver
// - `NETSYNC_DRIVER_TYPE`: Driver type (dry_run). Default: dry_run
//
// ### Reconciler
// - `NETSYNC_PUSH_TIMEOUT_MS`: Timeout of one device push
// - `NETSYNC_RETRY_DELAY_SECS`: Delay before a failed job is retried
// - `NETSYNC_POLL_INTERVAL_SECS`: Interval of the pending-job scan
// - `NETSYNC_DRIFT_INTERVAL_SECS`: Interval of the drift sweep (0 disables)
// - `NETSYNC_DRAIN_TIMEOUT_SECS`: Time allowed for in-flight pushes on shutdown
//
// ### Pool
// - `NETSYNC_RELEASE_COOLDOWN_SECS`: How long released addresses stay out of auto-pick
//
// ### Logging
// - `NETSYNC_LOG_LEVEL`: trace, debug, info, warn, error. Default: info
//
// ## Example
//
// ```bash
// export NETSYNC_STORE_TYPE=file
// export NETSYNC_STORE_PATH=/var/lib/netsync/state.json
// export NETSYNC_PUSH_TIMEOUT_MS=3000
//
// netsyncd
// ```

use anyhow::{Context, Result};
use netsync_core::config::{DriverConfig, NetsyncConfig, StoreConfig};
use netsync_core::{NetsyncCore, PluginRegistry, ReconcilerEvent};
use std::env;
use std::process::ExitCode;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum NetsyncExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<NetsyncExitCode> for ExitCode {
    fn from(code: NetsyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    store_type: String,
    store_path: Option<String>,
    driver_type: String,
    push_timeout_ms: Option<u64>,
    retry_delay_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    drift_interval_secs: Option<u64>,
    drain_timeout_secs: Option<u64>,
    release_cooldown_secs: Option<u64>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            store_type: env::var("NETSYNC_STORE_TYPE").unwrap_or_else(|_| "file".to_string()),
            store_path: env::var("NETSYNC_STORE_PATH").ok(),
            driver_type: env::var("NETSYNC_DRIVER_TYPE").unwrap_or_else(|_| "dry_run".to_string()),
            push_timeout_ms: env_u64("NETSYNC_PUSH_TIMEOUT_MS")?,
            retry_delay_secs: env_u64("NETSYNC_RETRY_DELAY_SECS")?,
            poll_interval_secs: env_u64("NETSYNC_POLL_INTERVAL_SECS")?,
            drift_interval_secs: env_u64("NETSYNC_DRIFT_INTERVAL_SECS")?,
            drain_timeout_secs: env_u64("NETSYNC_DRAIN_TIMEOUT_SECS")?,
            release_cooldown_secs: env_u64("NETSYNC_RELEASE_COOLDOWN_SECS")?,
            log_level: env::var("NETSYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration
    ///
    /// Checks type names, required paths and numeric ranges before anything
    /// touches disk or the network.
    fn validate(&self) -> Result<()> {
        match self.store_type.as_str() {
            "file" | "memory" => {}
            _ => anyhow::bail!(
                "NETSYNC_STORE_TYPE '{}' is not supported. \
                Supported types: file, memory",
                self.store_type
            ),
        }

        match self.driver_type.as_str() {
            "dry_run" => {}
            _ => anyhow::bail!(
                "NETSYNC_DRIVER_TYPE '{}' is not supported by this build. \
                Supported drivers: dry_run",
                self.driver_type
            ),
        }

        if self.store_type == "file" {
            let Some(path) = self.store_path.as_deref() else {
                anyhow::bail!(
                    "NETSYNC_STORE_PATH is required when NETSYNC_STORE_TYPE=file. \
                    Set it via: export NETSYNC_STORE_PATH=/var/lib/netsync/state.json"
                );
            };
            if path.is_empty() {
                anyhow::bail!("NETSYNC_STORE_PATH cannot be empty when NETSYNC_STORE_TYPE=file");
            }
            if let Some(parent) = std::path::Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                anyhow::bail!(
                    "NETSYNC_STORE_PATH parent directory does not exist: {}. \
                    Create it first: sudo mkdir -p {}",
                    parent.display(),
                    parent.display()
                );
            }
        }

        if let Some(timeout) = self.push_timeout_ms
            && !(100..=120_000).contains(&timeout)
        {
            anyhow::bail!(
                "NETSYNC_PUSH_TIMEOUT_MS must be between 100 and 120000. Got: {}",
                timeout
            );
        }

        if let Some(delay) = self.retry_delay_secs
            && delay > 3600
        {
            anyhow::bail!(
                "NETSYNC_RETRY_DELAY_SECS must be at most 3600 seconds. Got: {}",
                delay
            );
        }

        if let Some(interval) = self.poll_interval_secs
            && !(1..=3600).contains(&interval)
        {
            anyhow::bail!(
                "NETSYNC_POLL_INTERVAL_SECS must be between 1 and 3600 seconds. Got: {}",
                interval
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "NETSYNC_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Build the core configuration, defaulting whatever is unset
    fn to_core_config(&self) -> NetsyncConfig {
        let mut config = NetsyncConfig::new();

        config.store = match self.store_type.as_str() {
            "file" => StoreConfig::File {
                path: self.store_path.clone().unwrap_or_default(),
            },
            _ => StoreConfig::Memory,
        };
        config.driver = DriverConfig::DryRun;

        let reconciler = &mut config.reconciler;
        if let Some(v) = self.push_timeout_ms {
            reconciler.push_timeout_ms = v;
        }
        if let Some(v) = self.retry_delay_secs {
            reconciler.retry_delay_secs = v;
        }
        if let Some(v) = self.poll_interval_secs {
            reconciler.poll_interval_secs = v;
        }
        if let Some(v) = self.drift_interval_secs {
            reconciler.drift_interval_secs = v;
        }
        if let Some(v) = self.drain_timeout_secs {
            reconciler.drain_timeout_secs = v;
        }
        if let Some(v) = self.release_cooldown_secs {
            config.pool.release_cooldown_secs = v;
        }

        config
    }
}

/// Read an optional numeric variable, failing on garbage
fn env_u64(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a non-negative integer, got '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return NetsyncExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return NetsyncExitCode::ConfigError.into();
    }

    let core_config = config.to_core_config();
    if let Err(e) = core_config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return NetsyncExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return NetsyncExitCode::ConfigError.into();
    }

    info!("Starting netsyncd daemon");
    info!(
        store = config.store_type.as_str(),
        driver = config.driver_type.as_str(),
        "Configuration loaded"
    );

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return NetsyncExitCode::RuntimeError.into();
        }
    };

    rt.block_on(async {
        match run_daemon(core_config).await {
            Ok(()) => NetsyncExitCode::CleanShutdown,
            Err(DaemonError::Startup(e)) => {
                error!("Startup failed: {:#}", e);
                NetsyncExitCode::ConfigError
            }
            Err(DaemonError::Runtime(e)) => {
                error!("Daemon error: {:#}", e);
                NetsyncExitCode::RuntimeError
            }
        }
    })
    .into()
}

/// Failure of the daemon, split by the exit code it maps to
enum DaemonError {
    Startup(anyhow::Error),
    Runtime(anyhow::Error),
}

/// Run the daemon
async fn run_daemon(config: NetsyncConfig) -> std::result::Result<(), DaemonError> {
    let registry = PluginRegistry::with_builtins();
    info!(
        drivers = ?registry.list_drivers(),
        stores = ?registry.list_stores(),
        "Plugin registry ready"
    );

    let (core, streams) = NetsyncCore::from_config(config, &registry)
        .await
        .context("failed to assemble provisioning core")
        .map_err(DaemonError::Startup)?;

    // Drain observation streams into the log so neither channel fills up.
    let mut audit = streams.audit;
    let audit_task = tokio::spawn(async move {
        while let Some(entry) = audit.next().await {
            debug!(seq = entry.seq, entity = ?entry.entity, event = ?entry.event, "audit");
        }
    });
    let mut events = streams.events;
    let events_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ReconcilerEvent::JobOutOfSync { job, router, error } => {
                    warn!(%job, %router, "Job needs operator attention: {}", error)
                }
                ReconcilerEvent::DriftDetected { router, raised } => {
                    warn!(%router, raised, "Drift detected")
                }
                other => debug!(?other, "reconciler event"),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let signal_task = tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => info!("Received shutdown signal: {}", signal),
            Err(e) => error!("Signal handling failed, shutting down: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    info!("Reconciler running");
    let result = core
        .reconciler()
        .run_with_shutdown(Some(shutdown_rx))
        .await
        .context("reconciler stopped with an error")
        .map_err(DaemonError::Runtime);

    signal_task.abort();
    drop(core);
    // Both streams close once the last core handle is gone.
    let _ = events_task.await;
    let _ = audit_task.await;

    info!("netsyncd stopped");
    result
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for CTRL-C")?;
    Ok("SIGINT")
}
