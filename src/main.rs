use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use turkis::acme::CertificateManager;
use turkis::challenge::{ChallengeResponder, ChallengeStore};
use turkis::config::{Settings, ACME_RESPONDER_PORT, EVENT_CHANNEL_CAPACITY};
use turkis::docker::{self, ContainerSource};
use turkis::haproxy::AdminClient;
use turkis::monitor::Monitor;
use turkis::proxy_config::ConfigWriter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("turkis=debug".parse().expect("valid log directive")),
        )
        .init();

    let settings = Settings::from_env();
    info!(
        version = VERSION,
        root = %settings.root.display(),
        admin_socket = %settings.admin_socket.display(),
        dry_run = settings.dry_run,
        tls_staging = settings.tls_staging,
        no_tls = settings.no_tls,
        "starting turkis monitor"
    );

    settings
        .ensure_directories()
        .context("failed to provision state directories")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The admin socket must answer before anything gets published; in dry
    // run the socket is never touched at all.
    let admin = AdminClient::new(&settings.admin_socket, settings.dry_run);
    if !admin.is_dry_run() {
        admin
            .check()
            .await
            .context("HAProxy admin socket unreachable at startup")?;
    }

    let client = docker::connect(settings.docker_host.as_deref())
        .await
        .context("failed to connect to Docker")?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let source = ContainerSource::new(client, events_tx, shutdown_rx.clone());
    let mut source_handle = tokio::spawn(source.run());

    // Certificate management, unless disabled outright.
    let certs = if settings.no_tls {
        info!("NO_TLS set, certificate management disabled");
        None
    } else {
        let store = ChallengeStore::new();
        let manager = CertificateManager::new(&settings, store.clone(), admin.clone())
            .context("failed to initialize certificate manager")?;

        let responder = ChallengeResponder::bind(ACME_RESPONDER_PORT, store, shutdown_rx.clone())
            .await
            .context("failed to start ACME challenge responder")?;
        tokio::spawn(responder.run());

        tokio::spawn(Arc::clone(&manager).run_renewal(shutdown_rx.clone()));
        Some(manager)
    };

    let writer = ConfigWriter::new(&settings, ACME_RESPONDER_PORT);
    let monitor = Monitor::new(writer, admin, certs.clone(), events_rx, shutdown_rx.clone());
    let monitor_handle = tokio::spawn(monitor.run());

    // Run until a signal arrives or the container source dies with a
    // non-transport error.
    let mut source_failed = false;
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
            result = &mut source_handle => {
                match result {
                    Ok(Ok(())) => warn!("container source exited unexpectedly"),
                    Ok(Err(e)) => {
                        error!(error = %e, "container source failed");
                        source_failed = true;
                    }
                    Err(e) => {
                        error!(error = %e, "container source task panicked");
                        source_failed = true;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
            }
            result = &mut source_handle => {
                if !matches!(result, Ok(Ok(()))) {
                    error!("container source failed");
                    source_failed = true;
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Some(manager) = &certs {
        manager.shutdown_drain().await;
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = monitor_handle.await;
    })
    .await;

    if source_failed {
        anyhow::bail!("container event source failed; see logs");
    }

    info!("shutdown complete");
    Ok(())
}
