use power_monitor::config::{config_path_from_env, port_from_env};
use power_monitor::{LifecycleController, LifecycleOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting power monitor");
    let options = LifecycleOptions {
        port: port_from_env(),
        config_path: config_path_from_env().into(),
        ..LifecycleOptions::default()
    };

    let mut service = LifecycleController::new(options);
    service.start();

    shutdown_signal().await?;
    service.stop().await;

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
