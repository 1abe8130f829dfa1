//! Binary entrypoint (A4).
//!
//! Parses configuration, initialises logging, builds a scoped `tokio` runtime (the rewrite's
//! replacement for the teacher's process-wide MongoDB driver init handle, §5/§9), runs the
//! `Orchestrator`, and maps the result onto the exit codes in §6.

use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mongosync::{Config, Orchestrator};

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // A rolling `tracing` subscriber needs its `WorkerGuard` kept alive for the process's
    // lifetime; holding it in `main` plays the part the teacher's global driver handle played.
    let _log_guard = match mongosync::logging::init(&config.log_level, &config.log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialise logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("mongosync starting");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to build the async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(config));

    match result {
        Ok(()) => {
            info!("mongosync completed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("mongosync failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: mongosync::Config) -> mongosync::Result<()> {
    let cancellation = CancellationToken::new();

    let signal_cancellation = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancellation.cancel();
        }
    });

    let orchestrator = Orchestrator::new(config);
    orchestrator.run(cancellation).await
}
