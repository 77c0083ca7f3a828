//! HAProxy configuration rendering and atomic publishing.
//!
//! The renderer is a pure function of the registry snapshot: deployments
//! arrive sorted by app name and domains keep their descriptor order, so
//! two renders over equal snapshots are byte-identical. Publishing writes a
//! sibling tmp file, fsyncs and renames it over the live path, so readers
//! only ever see the old or the new configuration.

use std::path::PathBuf;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::Settings;
use crate::registry::Deployment;

const TEMPLATE: &str = include_str!("../templates/haproxy.cfg");
const INDENT: &str = "    ";

pub struct ConfigWriter {
    config_path: PathBuf,
    cert_dir: PathBuf,
    admin_socket: PathBuf,
    acme_port: u16,
}

impl ConfigWriter {
    pub fn new(settings: &Settings, acme_port: u16) -> Self {
        Self {
            config_path: settings.haproxy_config_path(),
            cert_dir: settings.cert_dir(),
            admin_socket: settings.admin_socket.clone(),
            acme_port,
        }
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Render the full configuration for a snapshot. Deployments without
    /// instances contribute an empty backend, which HAProxy treats as
    /// all-down; the registry never hands those out.
    pub fn render(&self, deployments: &[Deployment]) -> String {
        let mut https_frontend = String::new();
        let mut http_frontend = String::new();
        let mut backends = String::new();

        for deployment in deployments {
            render_frontend_rules(deployment, &mut https_frontend, &mut http_frontend);
        }
        for deployment in deployments {
            render_backend(deployment, &mut backends);
        }

        TEMPLATE
            .replace("{{ADMIN_SOCKET}}", &self.admin_socket.display().to_string())
            .replace("{{CERT_DIR}}", &self.cert_dir.display().to_string())
            .replace("{{ACME_PORT}}", &self.acme_port.to_string())
            .replace("{{HTTPS_FRONTEND}}", https_frontend.trim_end())
            .replace("{{HTTP_FRONTEND}}", http_frontend.trim_end())
            .replace("{{BACKENDS}}", backends.trim_end())
    }

    /// Atomically replace the live configuration file: tmp write, fsync,
    /// rename. The live path holds either the old or the new bytes at every
    /// instant.
    pub async fn publish(&self, contents: &str) -> anyhow::Result<()> {
        let tmp_path = self.config_path.with_extension("cfg.tmp");

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(contents.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.config_path)
            .await
            .with_context(|| {
                format!(
                    "failed to rename {} over {}",
                    tmp_path.display(),
                    self.config_path.display()
                )
            })?;

        info!(path = %self.config_path.display(), bytes = contents.len(), "proxy configuration published");
        Ok(())
    }
}

/// ACLs and redirect rules for one deployment.
///
/// HTTPS frontend: one ACL per canonical host routing to the app's backend,
/// one ACL plus 301 per alias redirecting onto its canonical. HTTP
/// frontend: every host 301-redirects to the canonical over HTTPS (ACME
/// challenge routing is fixed in the template and takes precedence).
fn render_frontend_rules(deployment: &Deployment, https: &mut String, http: &mut String) {
    let backend = &deployment.labels.app_name;
    let mut canonical_acls = Vec::new();

    for domain in &deployment.labels.domains {
        let canonical = &domain.canonical;
        let acl = format!("{backend}_{}_canonical", sanitize_host(canonical));

        https.push_str(&format!("{INDENT}acl {acl} hdr(host) -i {canonical}\n"));
        canonical_acls.push(acl.clone());

        http.push_str(&format!("{INDENT}acl {acl} hdr(host) -i {canonical}\n"));
        http.push_str(&format!(
            "{INDENT}http-request redirect code 301 location https://{canonical}%[req.uri] if {acl}\n"
        ));

        for alias in &domain.aliases {
            let alias_acl = format!("{backend}_{}_alias", sanitize_host(alias));

            https.push_str(&format!("{INDENT}acl {alias_acl} hdr(host) -i {alias}\n"));
            https.push_str(&format!(
                "{INDENT}http-request redirect code 301 location https://{canonical}%[req.uri] if {alias_acl}\n"
            ));

            http.push_str(&format!("{INDENT}acl {alias_acl} hdr(host) -i {alias}\n"));
            http.push_str(&format!(
                "{INDENT}http-request redirect code 301 location https://{canonical}%[req.uri] if {alias_acl}\n"
            ));
        }
    }

    if !canonical_acls.is_empty() {
        https.push_str(&format!(
            "{INDENT}use_backend {backend} if {}\n",
            canonical_acls.join(" or ")
        ));
    }
}

fn render_backend(deployment: &Deployment, backends: &mut String) {
    let backend = &deployment.labels.app_name;
    backends.push_str(&format!("backend {backend}\n"));
    for (i, instance) in deployment.instances.iter().enumerate() {
        backends.push_str(&format!(
            "{INDENT}server {backend}/inst{i} {}:{} check\n",
            instance.ip, instance.port
        ));
    }
    backends.push('\n');
    debug!(
        app = %backend,
        instances = deployment.instances.len(),
        "rendered backend"
    );
}

/// Host names feed into ACL identifiers, where dots are not wanted; the
/// matcher itself keeps the verbatim host.
fn sanitize_host(host: &str) -> String {
    host.replace('.', "_")
}
