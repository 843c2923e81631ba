#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

use push_token_lifecycle::adapters::lifecycle::LifecycleBus;
use push_token_lifecycle::adapters::network::WatchReachability;
use push_token_lifecycle::adapters::push::FileTokenSource;
use push_token_lifecycle::config::{Command, Config};
use push_token_lifecycle::{App, AppBuilder, telemetry};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    let telemetry_guard = telemetry::init_telemetry(&config.telemetry)?;

    push_token_lifecycle::setup_panic_hook();

    // Phase 1: Component Wiring
    let lifecycle = LifecycleBus::default();
    let app = async {
        let mut builder = AppBuilder::new(config.clone()).with_lifecycle(Arc::new(lifecycle.clone()));
        if let Some(path) = &config.provider.token_file {
            builder = builder.with_token_file(Arc::new(FileTokenSource::new(path)));
        }
        if config.reachability.probe_interval_secs > 0 {
            builder = builder.with_probe(Arc::new(WatchReachability::default()));
        }
        builder.build()
    }
    .instrument(tracing::info_span!("boot"))
    .await?;

    // Phase 2: One-shot commands
    let result = match config.command.unwrap_or(Command::Run) {
        Command::Run => run(app, lifecycle, config.shutdown_timeout_secs).await,
        Command::Register => {
            let registered = app.manager.register_now().await;
            app.scheduler.shutdown();
            registered.map_err(anyhow::Error::from).and_then(|record| print_json(&record))
        }
        Command::Status => print_json(&app.manager.diagnostics().await),
        Command::Reset => app.manager.reset().await.map_err(anyhow::Error::from),
    };

    telemetry_guard.shutdown();
    result
}

async fn run(app: App, lifecycle: LifecycleBus, shutdown_timeout_secs: u64) -> anyhow::Result<()> {
    // Phase 3: Start Runtime
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    push_token_lifecycle::spawn_signal_handler(shutdown_tx, lifecycle);

    let worker_tasks = app.workers.spawn_all(shutdown_rx.clone());
    tracing::info!("Token lifecycle running");

    let mut rx = shutdown_rx;
    let _ = rx.wait_for(|&s| s).await;

    // Phase 4: Graceful Shutdown Orchestration
    tokio::select! {
        () = async {
            futures::future::join_all(worker_tasks).await;
        } => {
            tracing::info!("Background tasks finished.");
        }
        () = tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout_secs)) => {
            tracing::warn!("Timeout waiting for background tasks to finish.");
        }
    }

    app.scheduler.shutdown();
    Ok(())
}
