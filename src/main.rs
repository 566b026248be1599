use clap::Parser;
use lifeguard::config::AppConfig;
use lifeguard::{
    logging, AppError, Application, Config, HandlerError, HandlerToken, Lifecycle, RunError,
    Signal, StatusFile,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// A small supervised service: heartbeats until SIGINT/SIGTERM, then shuts
/// down gracefully within a bounded grace period.
#[derive(Parser, Debug)]
#[command(name = "lifeguard", version, about)]
pub struct Cli {
    /// Config file path (default: ./lifeguard.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level: off, error, warn, info, debug, trace (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Log file, "-" for stderr (overrides config)
    #[arg(long)]
    log_file: Option<String>,

    /// Include file:line in log records
    #[arg(long)]
    caller: bool,

    /// Heartbeat interval in seconds (overrides config)
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Print the resolved config as JSON and exit
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(file) = &self.log_file {
            config.logging.file = file.clone();
        }
        if self.caller {
            config.logging.caller = true;
        }
        if let Some(secs) = self.heartbeat {
            config.app.heartbeat_secs = secs;
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<Config, AppError> {
    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_env()?;
    cli.apply(&mut config);
    Ok(config)
}

/// Heartbeats until the process context is cancelled.
///
/// SIGHUP reloads the `[app]` section, SIGUSR1 writes the status file.
struct Heartbeat {
    config_path: Option<PathBuf>,
    app: Arc<Mutex<AppConfig>>,
    status: StatusFile,
}

impl Heartbeat {
    fn new(config_path: Option<PathBuf>, app: AppConfig) -> Self {
        let status = StatusFile::new(app.status_file.clone());
        Self {
            config_path,
            app: Arc::new(Mutex::new(app)),
            status,
        }
    }

    fn reload_handler(&self) -> HandlerToken {
        let path = self.config_path.clone();
        let app = self.app.clone();
        HandlerToken::new("reload", move |_event| {
            let path = path.clone();
            let app = app.clone();
            async move {
                let mut config = Config::load(path.as_deref()).map_err(HandlerError::failed)?;
                config.apply_env().map_err(HandlerError::failed)?;
                tracing::info!(heartbeat_secs = config.app.heartbeat_secs, "config reloaded");
                *app.lock() = config.app;
                Ok(())
            }
        })
    }

    fn status_handler(&self, lifecycle: &Lifecycle) -> HandlerToken {
        let lifecycle = lifecycle.clone();
        let status = self.status.clone();
        HandlerToken::new("status", move |_event| {
            let lifecycle = lifecycle.clone();
            let status = status.clone();
            async move {
                status.write(&lifecycle.status()).map_err(HandlerError::failed)?;
                tracing::info!(path = %status.path().display(), "status written");
                Ok(())
            }
        })
    }
}

impl Application for Heartbeat {
    async fn init(&mut self, lifecycle: &Lifecycle) -> Result<(), AppError> {
        lifecycle.register(&self.reload_handler(), &[Signal::SIGHUP]);
        lifecycle.register(&self.status_handler(lifecycle), &[Signal::SIGUSR1]);

        let interrupted = HandlerToken::new("interrupted", |event| async move {
            tracing::info!(signal = %event.signal, "termination signal received");
            Ok(())
        });
        lifecycle.register(&interrupted, &[Signal::SIGINT, Signal::SIGTERM]);

        let status = self.status.clone();
        lifecycle.register_finalizer(move || {
            if let Err(e) = status.remove() {
                tracing::warn!(error = %e, "status file left behind");
            }
        });
        lifecycle.register_finalizer(|| tracing::info!("finalizers running"));
        Ok(())
    }

    async fn main(&mut self, lifecycle: &Lifecycle) -> Result<(), AppError> {
        let context = lifecycle.context().clone();
        let mut beats: u64 = 0;

        loop {
            let interval = Duration::from_secs(self.app.lock().heartbeat_secs.max(1));
            tokio::select! {
                _ = context.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    beats += 1;
                    tracing::info!(beats, "heartbeat");
                }
            }
        }

        if self.app.lock().slow_shutdown {
            lifecycle.request_prolongation("draining in-flight work")?;
            let remaining = lifecycle
                .deadline()
                .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
                .unwrap_or_default();
            let drain = remaining.saturating_sub(Duration::from_secs(1)).min(Duration::from_secs(3));
            tracing::info!(drain_ms = drain.as_millis() as u64, "draining before exit");
            tokio::time::sleep(drain).await;
        }

        tracing::info!(beats, "heartbeat stopped");
        Ok(())
    }

    async fn down(&mut self, _lifecycle: &Lifecycle) {
        tracing::debug!("heartbeat down");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("lifeguard: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("lifeguard: {e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("lifeguard: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!("lifeguard starting");
    tracing::debug!(?cli, "parsed CLI arguments");

    let lifecycle = Lifecycle::new();
    let app = Heartbeat::new(cli.config.clone(), config.app);
    match lifecycle.run(app).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Init(_)) | Err(RunError::Main(_)) => ExitCode::FAILURE,
    }
}
