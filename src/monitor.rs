//! The monitor event loop.
//!
//! A single task serializes container events, periodic reconcile ticks and
//! certificate-sync ticks into ordered work. Reconciliation takes a registry
//! snapshot, rejects domain conflicts, renders and publishes the proxy
//! configuration, asks HAProxy to reload and diffs the advertised domain
//! set against the certificate manager.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::acme::CertificateManager;
use crate::config::{CERT_SYNC_INTERVAL, RECONCILE_INTERVAL, RECONCILE_STEP_TIMEOUT};
use crate::docker::{ContainerEvent, ContainerEventKind};
use crate::error::DomainConflict;
use crate::haproxy::AdminClient;
use crate::labels::DeploymentLabels;
use crate::proxy_config::ConfigWriter;
use crate::registry::{
    Deployment, DeploymentInstance, DeploymentRegistry, ObserveOutcome, RemovalOutcome,
};

pub struct Monitor {
    registry: DeploymentRegistry,
    writer: ConfigWriter,
    admin: AdminClient,
    certs: Option<Arc<CertificateManager>>,
    events_rx: mpsc::Receiver<ContainerEvent>,
    /// One-slot dirty channel: a queued reconcile absorbs further marks.
    dirty_tx: mpsc::Sender<()>,
    dirty_rx: mpsc::Receiver<()>,
    shutdown_rx: watch::Receiver<bool>,
    /// Container ids whose labels failed to parse, so each is logged once.
    parse_failures: HashSet<String>,
}

impl Monitor {
    pub fn new(
        writer: ConfigWriter,
        admin: AdminClient,
        certs: Option<Arc<CertificateManager>>,
        events_rx: mpsc::Receiver<ContainerEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        Self {
            registry: DeploymentRegistry::new(),
            writer,
            admin,
            certs,
            events_rx,
            dirty_tx,
            dirty_rx,
            shutdown_rx,
            parse_failures: HashSet::new(),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut reconcile_tick = interval(RECONCILE_INTERVAL);
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cert_tick = interval(CERT_SYNC_INTERVAL);
        cert_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // `interval` fires immediately, giving the initial reconcile and
        // certificate sync right after the seed scan lands.
        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("event channel closed");
                        break;
                    }
                },
                Some(()) = self.dirty_rx.recv() => {
                    self.reconcile().await;
                }
                _ = reconcile_tick.tick() => {
                    debug!("periodic reconcile");
                    self.reconcile().await;
                }
                _ = cert_tick.tick() => {
                    self.certificate_sync().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("monitor loop shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_event(&mut self, event: ContainerEvent) {
        match event.kind {
            ContainerEventKind::Start => self.handle_start(event),
            ContainerEventKind::Die | ContainerEventKind::Stop | ContainerEventKind::Kill => {
                self.handle_removal(&event.id)
            }
        }
    }

    fn handle_start(&mut self, event: ContainerEvent) {
        let Some(inspected) = event.inspected else {
            return;
        };

        let labels = match DeploymentLabels::parse(&inspected.labels) {
            Ok(labels) => labels,
            Err(e) => {
                // Log once per container; the same container will keep
                // producing identical failures.
                if self.parse_failures.insert(event.id.clone()) {
                    warn!(container_id = %event.id, error = %e, "ignoring container with unparseable labels");
                }
                return;
            }
        };

        let Some(ip) = inspected.ip else {
            debug!(container_id = %event.id, "start event without shared-network address");
            return;
        };

        let instance = DeploymentInstance {
            container_id: event.id.clone(),
            ip,
            port: labels.port.clone(),
        };

        let app = labels.app_name.clone();
        let deployment_id = labels.deployment_id.clone();
        let outcome = self.registry.observe_start(labels, instance);
        info!(
            app = %app,
            deployment_id = %deployment_id,
            container_id = %event.id,
            outcome = ?outcome,
            "container started"
        );

        if outcome != ObserveOutcome::Ignored {
            self.mark_dirty();
        }
    }

    fn handle_removal(&mut self, container_id: &str) {
        let outcome = self.registry.observe_removal(container_id);
        match &outcome {
            RemovalOutcome::NoChange => {
                debug!(container_id, "removal of unknown or orphaned container");
            }
            outcome => {
                info!(container_id, outcome = ?outcome, "container removed");
                self.mark_dirty();
            }
        }

        self.parse_failures.remove(container_id);
    }

    /// Queue a reconcile. The 1-slot channel debounces: if one is already
    /// queued, this mark is absorbed by it.
    fn mark_dirty(&self) {
        let _ = self.dirty_tx.try_send(());
    }

    /// One full reconcile pass. Each failure is logged and left for the
    /// next tick; the rendered file on disk is never rolled back.
    async fn reconcile(&mut self) {
        let snapshot = self.registry.snapshot();
        let accepted = reject_conflicts(&snapshot);

        let rendered = self.writer.render(&accepted);
        let publish_and_reload = async {
            self.writer.publish(&rendered).await?;
            if let Err(e) = self.admin.reload().await {
                // The file is live on disk; the next reconcile retries.
                warn!(error = %e, "HAProxy reload failed, configuration stays on disk");
            }
            anyhow::Ok(())
        };

        match timeout(RECONCILE_STEP_TIMEOUT, publish_and_reload).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "failed to publish proxy configuration");
                return;
            }
            Err(_) => {
                error!(deadline = ?RECONCILE_STEP_TIMEOUT, "reconcile pass timed out");
                return;
            }
        }

        if self.certs.is_some() {
            self.sync_domains(&accepted).await;
        }
    }

    /// Diff the advertised domain set against the certificate manager:
    /// newly seen canonicals get an immediate obtain, vanished canonicals
    /// are dropped from management (files stay on disk).
    async fn sync_domains(&self, accepted: &[Deployment]) {
        let Some(certs) = &self.certs else { return };

        let mut current: HashMap<String, (Vec<String>, String)> = HashMap::new();
        for deployment in accepted {
            for domain in &deployment.labels.domains {
                current.insert(
                    domain.canonical.clone(),
                    (domain.aliases.clone(), deployment.labels.acme_email.clone()),
                );
            }
        }

        for (canonical, (aliases, email)) in &current {
            if certs.add_domain(canonical, aliases, email).await {
                certs.spawn_obtain(canonical.clone());
            }
        }

        for canonical in certs.known_canonicals().await {
            if !current.contains_key(&canonical) {
                certs.remove_domain(&canonical).await;
            }
        }
    }

    /// Periodic certificate maintenance: refresh the domain set and push
    /// every on-disk bundle back into HAProxy.
    async fn certificate_sync(&mut self) {
        let Some(certs) = self.certs.clone() else {
            return;
        };

        info!("certificate sync");
        let snapshot = self.registry.snapshot();
        let accepted = reject_conflicts(&snapshot);
        self.sync_domains(&accepted).await;
        certs.sync_installed().await;
    }
}

/// Enforce exclusive host ownership across active deployments. Apps are
/// walked in ascending name order; the first claimant of a host keeps it
/// and later claimants are rejected whole, with a logged conflict.
pub fn reject_conflicts(snapshot: &[Deployment]) -> Vec<Deployment> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    let mut accepted = Vec::with_capacity(snapshot.len());

    'deployments: for deployment in snapshot {
        let app = deployment.labels.app_name.as_str();
        let hosts: Vec<&str> = deployment.labels.all_hosts().collect();

        for host in &hosts {
            if let Some(owner) = owners.get(host) {
                let conflict = DomainConflict {
                    host: host.to_string(),
                    owner: owner.to_string(),
                    claimant: app.to_string(),
                };
                error!(error = %conflict, "rejecting conflicting deployment");
                continue 'deployments;
            }
        }

        for host in hosts {
            owners.insert(host, app);
        }
        accepted.push(deployment.clone());
    }

    accepted
}
