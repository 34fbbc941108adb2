//! Main application entry point for the Conduit server.
//!
//! Loads configuration, sets up logging, builds the lobby dispatch table
//! and serves WebSocket connections until a termination signal arrives.

mod cli;
mod config;
mod handlers;
mod logging;

use anyhow::Context;
use cli::CliArgs;
use conduit_server::{ConduitServer, JsonSerializer, SchedulerStats, WireSerializer};
use config::AppConfig;
use handlers::{ClientEnvelope, Lobby, ServerEnvelope};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{error, info, warn};

type LobbyServer = ConduitServer<ClientEnvelope, ServerEnvelope>;

/// Main application struct.
pub struct Application {
    config: AppConfig,
    server: Arc<LobbyServer>,
}

impl Application {
    /// Loads configuration, applies CLI overrides and creates the server.
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if let Some(output_workers) = args.output_workers {
            config.dispatch.output_workers = output_workers;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging)?;
        display_banner();

        let server_config = config.to_server_config()?;
        let table = handlers::build_dispatch_table().context("building dispatch table")?;
        let serializer: Arc<dyn WireSerializer<ClientEnvelope, ServerEnvelope>> = Arc::new(JsonSerializer);
        let server = ConduitServer::new(server_config, table, serializer)?;

        info!("📂 Config: {}", args.config_path.display());
        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    /// Serves until SIGINT/SIGTERM, then shuts down gracefully.
    pub async fn run(self) -> anyhow::Result<()> {
        let server_config = self.server.config();
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!("  👥 Max connections: {}", server_config.max_connections);
        info!(
            "  🧵 Output partitions: {} (queue capacity {})",
            server_config.output_workers, server_config.output_queue_capacity
        );
        info!("  📥 Input queue capacity: {}", server_config.input_queue_capacity);
        info!("  🕒 Tick interval: {}ms", server_config.tick_interval_ms);

        let mut server_handle = {
            let server = Arc::clone(&self.server);
            tokio::spawn(async move { server.start().await })
        };

        let monitoring_handle = {
            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval.tick().await;
                let mut last = SchedulerStats::default();

                loop {
                    interval.tick().await;
                    let stats = server.scheduler().stats();
                    let dispatched = stats.dispatched - last.dispatched;

                    info!(
                        "📊 System Health - {} messages/min | {} connections | {} pending inputs",
                        dispatched,
                        server.registry().connection_count(),
                        server.scheduler().pending_inputs()
                    );
                    if stats.handler_failures > last.handler_failures {
                        warn!(
                            "⚠️ {} handler failure(s) this minute",
                            stats.handler_failures - last.handler_failures
                        );
                    }
                    if stats.delivery_timeouts > last.delivery_timeouts {
                        warn!(
                            "⚠️ {} delivery timeout(s) this minute",
                            stats.delivery_timeouts - last.delivery_timeouts
                        );
                    }
                    last = stats;

                    let scheduler = server.scheduler();
                    let _ = tokio::task::spawn_blocking(move || {
                        scheduler.submit_handler_task::<Lobby, _>(|lobby| {
                            info!(
                                "🔔 {} tick subscriber(s) | {} ticks published",
                                lobby.subscriber_count(),
                                lobby.ticks_published()
                            );
                        })
                    })
                    .await;
                }
            })
        };

        info!("✅ Conduit Server is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let finished = tokio::select! {
            signal = wait_for_shutdown_signal() => {
                info!("📡 Received {}", signal?);
                None
            }
            finished = &mut server_handle => Some(finished),
        };
        let finished = match finished {
            Some(finished) => finished,
            None => {
                info!("🛑 Shutdown signal received, initiating graceful shutdown...");
                self.server.shutdown().await?;
                server_handle.await
            }
        };
        monitoring_handle.abort();

        match finished {
            Ok(Ok(())) => info!("✅ Server completed successfully"),
            Ok(Err(e)) => {
                error!("❌ Server error: {}", e);
                return Err(e.into());
            }
            Err(e) => {
                error!("❌ Server task failed: {}", e);
                return Err(e.into());
            }
        }

        let stats = self.server.scheduler().stats();
        info!("📊 Final Statistics:");
        info!("  - Messages dispatched: {}", stats.dispatched);
        info!("  - Tasks run: {}", stats.tasks_run);
        info!("  - Handler failures: {}", stats.handler_failures);
        info!("  - Unknown routes: {}", stats.unknown_routes);
        info!(
            "  - Deliveries: {} ({} failed, {} timed out)",
            stats.deliveries, stats.delivery_failures, stats.delivery_timeouts
        );
        info!("👋 Conduit Server shutdown complete");

        Ok(())
    }
}

/// Waits for SIGINT or SIGTERM, or Ctrl+C off Unix, and returns its name.
async fn wait_for_shutdown_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    let name = {
        use tokio::signal::unix::SignalKind;

        let mut signals =
            SignalPair::install((SignalKind::interrupt(), "SIGINT"), (SignalKind::terminate(), "SIGTERM"))?;
        signals.recv().await
    };

    #[cfg(not(unix))]
    let name = {
        tokio::signal::ctrl_c().await.context("listening for Ctrl+C")?;
        "Ctrl+C"
    };

    Ok(name)
}

/// Two Unix signals, either of which ends the wait.
#[cfg(unix)]
struct SignalPair {
    first: (tokio::signal::unix::Signal, &'static str),
    second: (tokio::signal::unix::Signal, &'static str),
}

#[cfg(unix)]
impl SignalPair {
    /// Registers both handlers; deliveries from here on are not lost.
    fn install(
        first: (tokio::signal::unix::SignalKind, &'static str),
        second: (tokio::signal::unix::SignalKind, &'static str),
    ) -> anyhow::Result<Self> {
        use tokio::signal::unix::signal;

        let install = |(kind, name): (tokio::signal::unix::SignalKind, &'static str)| {
            signal(kind)
                .map(|stream| (stream, name))
                .with_context(|| format!("installing {name} handler"))
        };
        Ok(Self {
            first: install(first)?,
            second: install(second)?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.first.0.recv() => self.first.1,
            _ = self.second.0.recv() => self.second.1,
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }
}

/// Display startup banner using proper logging
fn display_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("╔══════════════════════════════════════════╗");
    info!("║             🔀 CONDUIT SERVER            ║");
    info!("║                  v{:<23}║", version);
    info!("║                                          ║");
    info!("║  Ordered dispatch for WebSocket clients  ║");
    info!("║                                          ║");
    info!("║  🧵 Single-threaded business logic       ║");
    info!("║  📬 Partitioned, ordered output          ║");
    info!("║  🧱 Bounded queues with backpressure     ║");
    info!("╚══════════════════════════════════════════╝");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::signal::unix::SignalKind;

    #[tokio::test]
    async fn test_signal_pair_reports_the_signal_received() {
        let mut signals =
            SignalPair::install((SignalKind::user_defined1(), "SIGUSR1"), (SignalKind::user_defined2(), "SIGUSR2"))
                .unwrap();

        let status = std::process::Command::new("kill")
            .args(["-USR2", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let received = tokio::time::timeout(Duration::from_secs(5), signals.recv()).await.unwrap();
        assert_eq!(received, "SIGUSR2");
    }
}
