//! Container lifecycle event source.
//!
//! Subscribes to Docker events filtered to containers, inspects each
//! container once and forwards typed [`ContainerEvent`]s to the monitor
//! loop. Start events are dropped early when the container is not eligible
//! (opted out via `turkis.ignore` or not attached to the shared network);
//! death events always pass through so bookkeeping can clean up.

use std::collections::HashMap;

use bollard::container::ListContainersOptions;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{DOCKER_NETWORK, RESUBSCRIBE_BACKOFF};
use crate::labels::LABEL_IGNORE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEventKind {
    Start,
    Die,
    Stop,
    Kill,
}

impl ContainerEventKind {
    fn from_action(action: &str) -> Option<Self> {
        match action {
            "start" => Some(Self::Start),
            "die" => Some(Self::Die),
            "stop" => Some(Self::Stop),
            "kill" => Some(Self::Kill),
            _ => None,
        }
    }
}

/// What one inspection of a container yielded.
#[derive(Debug, Clone)]
pub struct Inspected {
    pub labels: HashMap<String, String>,
    pub networks: Vec<String>,
    /// IP address on the shared network, when attached.
    pub ip: Option<String>,
}

impl Inspected {
    pub fn on_shared_network(&self) -> bool {
        self.networks.iter().any(|n| n == DOCKER_NETWORK)
    }

    pub fn opted_out(&self) -> bool {
        matches!(self.labels.get(LABEL_IGNORE), Some(v) if v == "true" || v == "1")
    }

    /// A container is eligible for the registry when it has not opted out
    /// and carries an address on the shared network.
    pub fn eligible(&self) -> bool {
        !self.opted_out() && self.on_shared_network() && self.ip.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub kind: ContainerEventKind,
    pub id: String,
    /// Present for start events; death events may outlive the container's
    /// inspectable state.
    pub inspected: Option<Inspected>,
}

/// Connect to the Docker daemon and verify it responds.
///
/// Connection priority: explicit endpoint (from `DOCKER_HOST`), then the
/// default Unix socket.
pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Docker> {
    let client = match docker_host {
        Some(host) if host.starts_with("unix://") => {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)?
        }
        Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)?
        }
        Some(host) => {
            anyhow::bail!(
                "invalid DOCKER_HOST '{}': expected 'unix:///path' or 'tcp://host:port'",
                host
            )
        }
        None => Docker::connect_with_socket_defaults()?,
    };

    client.ping().await.map_err(|e| {
        anyhow::anyhow!("Docker daemon is not responding: {e}. Ensure dockerd is running.")
    })?;

    debug!("connected to Docker daemon");
    Ok(client)
}

/// Inspect a container and reduce the response to what the monitor needs.
pub async fn inspect(client: &Docker, container_id: &str) -> anyhow::Result<Inspected> {
    let response = client.inspect_container(container_id, None).await?;

    let labels = response
        .config
        .and_then(|c| c.labels)
        .unwrap_or_default();

    let networks = response
        .network_settings
        .and_then(|s| s.networks)
        .unwrap_or_default();

    let ip = networks
        .get(DOCKER_NETWORK)
        .and_then(|endpoint| endpoint.ip_address.clone())
        .filter(|ip| !ip.is_empty());

    Ok(Inspected {
        labels,
        networks: networks.into_keys().collect(),
        ip,
    })
}

/// Single-producer source of ordered container events.
pub struct ContainerSource {
    client: Docker,
    tx: mpsc::Sender<ContainerEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ContainerSource {
    pub fn new(
        client: Docker,
        tx: mpsc::Sender<ContainerEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            tx,
            shutdown_rx,
        }
    }

    /// Run until shutdown. A dropped engine socket is survived with a
    /// bounded backoff and a fresh subscription; any other engine error is
    /// returned and takes the process down.
    pub async fn run(self) -> anyhow::Result<()> {
        let ContainerSource {
            client,
            tx,
            mut shutdown_rx,
        } = self;

        let mut seeded = false;
        loop {
            let mut stream = subscribe(&client);

            // Subscribe before the seed scan so containers started in
            // between are not missed; their events arrive after the seeds.
            if !seeded {
                seed_running(&client, &tx).await;
                seeded = true;
            }

            let fatal: Option<anyhow::Error> = loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(message)) => {
                            let action = message.action.as_deref().unwrap_or_default();
                            let Some(kind) = ContainerEventKind::from_action(action) else {
                                continue;
                            };
                            let Some(id) = message.actor.and_then(|a| a.id) else {
                                continue;
                            };
                            forward(&client, &tx, kind, id).await;
                        }
                        Some(Err(e)) if is_transport_lost(&e) => {
                            warn!(error = %e, "Docker event socket lost, resubscribing");
                            break None;
                        }
                        Some(Err(e)) => {
                            break Some(anyhow::anyhow!("Docker event subscription failed: {e}"));
                        }
                        None => {
                            warn!("Docker event stream ended, resubscribing");
                            break None;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("container source shutting down");
                            return Ok(());
                        }
                    }
                }
            };

            if let Some(e) = fatal {
                return Err(e);
            }

            drop(stream);
            tokio::select! {
                _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn subscribe(
    client: &Docker,
) -> impl futures::Stream<Item = Result<bollard::models::EventMessage, bollard::errors::Error>> + '_
{
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    client.events(Some(EventsOptions::<String> {
        filters,
        ..Default::default()
    }))
}

/// Synthesize start events for containers that were already running when
/// the monitor came up, so the first reconcile reflects reality.
async fn seed_running(client: &Docker, tx: &mpsc::Sender<ContainerEvent>) {
    let options = ListContainersOptions::<String> {
        all: false,
        ..Default::default()
    };

    let containers = match client.list_containers(Some(options)).await {
        Ok(containers) => containers,
        Err(e) => {
            warn!(error = %e, "failed to list running containers for the seed scan");
            return;
        }
    };

    info!(count = containers.len(), "seeding from running containers");
    for summary in containers {
        let Some(id) = summary.id else { continue };
        forward(client, tx, ContainerEventKind::Start, id).await;
    }
}

/// Inspect and deliver one event, applying start-event eligibility.
async fn forward(
    client: &Docker,
    tx: &mpsc::Sender<ContainerEvent>,
    kind: ContainerEventKind,
    id: String,
) {
    let inspected = match inspect(client, &id).await {
        Ok(inspected) => Some(inspected),
        Err(e) => {
            // Normal for death events: the container may already be gone.
            debug!(container_id = %id, error = %e, "container not inspectable");
            None
        }
    };

    if kind == ContainerEventKind::Start {
        let Some(ref inspected) = inspected else {
            return;
        };
        if !inspected.eligible() {
            debug!(
                container_id = %id,
                opted_out = inspected.opted_out(),
                on_network = inspected.on_shared_network(),
                "dropping ineligible start event"
            );
            return;
        }
    }

    if tx
        .send(ContainerEvent {
            kind,
            id,
            inspected,
        })
        .await
        .is_err()
    {
        debug!("event channel closed, dropping event");
    }
}

/// Engine-socket closure shows up as an I/O error or as hyper transport
/// noise; both are recoverable by resubscribing.
fn is_transport_lost(err: &bollard::errors::Error) -> bool {
    match err {
        bollard::errors::Error::IOError { err } => matches!(
            err.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        ),
        other => {
            let text = other.to_string();
            text.contains("connection refused")
                || text.contains("connection reset")
                || text.contains("unexpected EOF")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspected(ignore: Option<&str>, networks: &[&str], ip: Option<&str>) -> Inspected {
        let mut labels = HashMap::new();
        if let Some(v) = ignore {
            labels.insert(LABEL_IGNORE.to_string(), v.to_string());
        }
        Inspected {
            labels,
            networks: networks.iter().map(|n| n.to_string()).collect(),
            ip: ip.map(|ip| ip.to_string()),
        }
    }

    #[test]
    fn test_eligibility() {
        assert!(inspected(None, &[DOCKER_NETWORK], Some("10.0.0.2")).eligible());
        assert!(inspected(Some("false"), &[DOCKER_NETWORK], Some("10.0.0.2")).eligible());

        // Opt-out label wins even on the shared network.
        assert!(!inspected(Some("true"), &[DOCKER_NETWORK], Some("10.0.0.2")).eligible());
        assert!(!inspected(Some("1"), &[DOCKER_NETWORK], Some("10.0.0.2")).eligible());

        // Wrong network or no address.
        assert!(!inspected(None, &["bridge"], Some("172.17.0.2")).eligible());
        assert!(!inspected(None, &[DOCKER_NETWORK], None).eligible());
    }

    #[test]
    fn test_event_kind_from_action() {
        assert_eq!(
            ContainerEventKind::from_action("start"),
            Some(ContainerEventKind::Start)
        );
        assert_eq!(
            ContainerEventKind::from_action("die"),
            Some(ContainerEventKind::Die)
        );
        assert_eq!(
            ContainerEventKind::from_action("stop"),
            Some(ContainerEventKind::Stop)
        );
        assert_eq!(
            ContainerEventKind::from_action("kill"),
            Some(ContainerEventKind::Kill)
        );
        assert_eq!(ContainerEventKind::from_action("create"), None);
        assert_eq!(ContainerEventKind::from_action("exec_start"), None);
    }

    #[test]
    fn test_transport_lost_detection() {
        let eof = bollard::errors::Error::IOError {
            err: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"),
        };
        assert!(is_transport_lost(&eof));

        let refused = bollard::errors::Error::IOError {
            err: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(is_transport_lost(&refused));

        let denied = bollard::errors::Error::IOError {
            err: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!is_transport_lost(&denied));
    }
}
