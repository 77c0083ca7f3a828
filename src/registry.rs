//! In-memory view of the winning deployment per application.
//!
//! The registry holds at most one entry per `app_name`: the descriptor of
//! the newest deployment generation seen so far plus every running instance
//! of that generation. Older generations keep running until their containers
//! die, but they are invisible here and never reach the proxy configuration.

use std::collections::BTreeMap;

use tracing::debug;

use crate::labels::DeploymentLabels;

/// One running container backing a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentInstance {
    pub container_id: String,
    /// IP address on the shared network.
    pub ip: String,
    pub port: String,
}

/// The winning deployment for one application.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub labels: DeploymentLabels,
    pub instances: Vec<DeploymentInstance>,
}

/// What `observe_start` did with an incoming instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// First deployment seen for this app.
    Created,
    /// Same generation; instance appended (or refreshed).
    InstanceAdded,
    /// Newer generation displaced the previous entry.
    Replaced,
    /// Obsolete generation; nothing changed.
    Ignored,
}

/// What `observe_removal` did with a disappearing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// Instance removed; the entry still has others.
    InstanceRemoved,
    /// Last instance removed; the whole entry is gone.
    EntryDropped(String),
    /// Unknown or already-orphaned container.
    NoChange,
}

/// Application name -> winning deployment. A `BTreeMap` keeps snapshots in
/// ascending app-name order, which the renderer relies on for determinism.
#[derive(Debug, Default)]
pub struct DeploymentRegistry {
    apps: BTreeMap<String, Deployment>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the winner rule to a started container.
    ///
    /// Deployment ids are 14-digit timestamps, so lexicographic comparison
    /// is chronological comparison: the greater id wins, ties join the
    /// existing entry, smaller ids are obsolete generations and ignored.
    pub fn observe_start(
        &mut self,
        labels: DeploymentLabels,
        instance: DeploymentInstance,
    ) -> ObserveOutcome {
        let app_name = labels.app_name.clone();

        let Some(entry) = self.apps.get_mut(&app_name) else {
            self.apps.insert(
                app_name,
                Deployment {
                    labels,
                    instances: vec![instance],
                },
            );
            return ObserveOutcome::Created;
        };

        if entry.labels.deployment_id == labels.deployment_id {
            // A restarted container can re-announce itself with a new IP.
            if let Some(existing) = entry
                .instances
                .iter_mut()
                .find(|i| i.container_id == instance.container_id)
            {
                *existing = instance;
            } else {
                entry.instances.push(instance);
            }
            ObserveOutcome::InstanceAdded
        } else if entry.labels.deployment_id < labels.deployment_id {
            debug!(
                app = %app_name,
                old = %entry.labels.deployment_id,
                new = %labels.deployment_id,
                "newer deployment generation takes over"
            );
            *entry = Deployment {
                labels,
                instances: vec![instance],
            };
            ObserveOutcome::Replaced
        } else {
            debug!(
                app = %app_name,
                current = %entry.labels.deployment_id,
                stale = %labels.deployment_id,
                "ignoring instance of an obsolete generation"
            );
            ObserveOutcome::Ignored
        }
    }

    /// Remove the instance backed by `container_id` wherever it appears.
    /// Containers of displaced generations were already dropped from the
    /// registry, so their removal reports `NoChange`.
    pub fn observe_removal(&mut self, container_id: &str) -> RemovalOutcome {
        let Some(app_name) = self
            .apps
            .iter()
            .find(|(_, d)| d.instances.iter().any(|i| i.container_id == container_id))
            .map(|(name, _)| name.clone())
        else {
            return RemovalOutcome::NoChange;
        };

        if let Some(entry) = self.apps.get_mut(&app_name) {
            entry.instances.retain(|i| i.container_id != container_id);
            if entry.instances.is_empty() {
                self.apps.remove(&app_name);
                return RemovalOutcome::EntryDropped(app_name);
            }
        }
        RemovalOutcome::InstanceRemoved
    }

    /// Consistent copy of every entry, sorted by app name.
    pub fn snapshot(&self) -> Vec<Deployment> {
        self.apps.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
