//! Clawlets runner daemon entry point.
//!
//! Hardens the process, loads (or creates) the runner keypair, publishes its
//! advertisement on stdout, then serves the loopback secrets buffer until
//! SIGINT/SIGTERM.

use anyhow::Context;
use tracing::info;

use clawlets_core::keypair::KeypairStore;
use clawlets_runner::LocalSecretsBuffer;
use clawlets_runner::config::RunnerConfig;
use clawlets_runner::hardening;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RunnerConfig::from_env();

    // Runs before logging is initialized, so warnings go to stderr directly.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(
        project_id = %config.project_id,
        runner = %config.runner_name,
        "clawlets runner starting"
    );

    let key_store = KeypairStore::for_runner(
        config.runtime_dir.as_deref(),
        &config.project_id,
        &config.runner_name,
    )
    .context("failed to resolve runner key path")?;
    let keypair = key_store
        .load_or_create()
        .await
        .with_context(|| format!("failed to load runner key at {}", key_store.path().display()))?;

    let advertisement = keypair.advertisement();
    info!(
        key_id = %advertisement.kid,
        path = %key_store.path().display(),
        "runner key ready"
    );
    publish_advertisement(&serde_json::to_string(&advertisement)?);

    let buffer_config = config
        .buffer_config()
        .context("invalid secrets buffer configuration")?;
    let buffer = LocalSecretsBuffer::start(buffer_config)
        .await
        .context("failed to start secrets buffer")?;

    shutdown_signal().await;

    buffer.stop().await.context("failed to stop secrets buffer")?;
    info!("clawlets runner stopped");
    Ok(())
}

/// The control plane reads the advertisement from the runner's stdout.
#[allow(clippy::print_stdout)]
fn publish_advertisement(json: &str) {
    println!("{json}");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping runner");
}

/// Apply process hardening before logging is initialized.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &RunnerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!(
            "WARNING: mlock disabled via CLAWLETS_DISABLE_MLOCK; secrets may be swapped to disk"
        );
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e} (set CLAWLETS_DISABLE_MLOCK=true for dev)");
    }
}
