//! Runtime settings and shared constants.
//!
//! All configuration comes from the environment; there is no config file for
//! the monitor itself. Applications are described entirely by container
//! labels (see [`crate::labels`]).

use std::path::PathBuf;
use std::time::Duration;

/// Name of the shared network containers must be attached to.
pub const DOCKER_NETWORK: &str = "turkis-public";

/// Default port a container serves HTTP on when `turkis.port` is absent.
pub const DEFAULT_CONTAINER_PORT: &str = "80";

/// Default health check path when `turkis.health-check-path` is absent.
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/";

/// Port the embedded ACME HTTP-01 responder listens on. HAProxy forwards
/// `/.well-known/acme-challenge/*` here.
pub const ACME_RESPONDER_PORT: u16 = 8080;

/// Full re-render of the proxy configuration, even without events.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Re-sync the managed domain set and re-install on-disk PEM bundles.
pub const CERT_SYNC_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Walk managed domains and renew certificates nearing expiry.
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Renew when the leaf certificate expires within this many days.
pub const RENEWAL_THRESHOLD_DAYS: u64 = 30;

/// Deadline for a single admin-socket request/response round trip.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for one reconcile pass (render, publish, reload).
pub const RECONCILE_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// How long shutdown waits for in-flight certificate workers.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Backoff before resubscribing after the Docker event socket drops.
pub const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(5);

/// Capacity of the container event channel between source and monitor.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Runtime settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all monitor state (`TURKIS_ROOT`).
    pub root: PathBuf,
    /// Docker daemon endpoint override (`DOCKER_HOST`).
    pub docker_host: Option<String>,
    /// Path to the HAProxy admin socket (`HAPROXY_ADMIN_SOCKET`).
    pub admin_socket: PathBuf,
    /// Log admin-socket commands instead of sending them (`DRY_RUN=true`).
    pub dry_run: bool,
    /// Target the Let's Encrypt staging directory (`TLS_STAGING=true`).
    pub tls_staging: bool,
    /// Disable certificate management entirely (`NO_TLS=true`).
    pub no_tls: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        let root = std::env::var("TURKIS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/turkis"));
        let admin_socket = std::env::var("HAPROXY_ADMIN_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/run/haproxy/admin.sock"));

        Self {
            root,
            docker_host: std::env::var("DOCKER_HOST").ok().filter(|v| !v.is_empty()),
            admin_socket,
            dry_run: env_flag("DRY_RUN"),
            tls_staging: env_flag("TLS_STAGING"),
            no_tls: env_flag("NO_TLS"),
        }
    }

    /// Directory holding the rendered HAProxy configuration.
    pub fn haproxy_config_dir(&self) -> PathBuf {
        self.root.join("haproxy-config")
    }

    /// The live configuration file, target of the atomic rename.
    pub fn haproxy_config_path(&self) -> PathBuf {
        self.haproxy_config_dir().join("haproxy.cfg")
    }

    /// Directory holding `<canonical>.crt/.key/.pem` files.
    pub fn cert_dir(&self) -> PathBuf {
        self.root.join("cert-storage")
    }

    /// Directory holding per-email ACME account credentials.
    pub fn account_dir(&self) -> PathBuf {
        self.cert_dir().join("accounts")
    }

    /// Webroot for HTTP-01 challenges. Tokens are served from memory, but
    /// the directory is provisioned so the proxy's challenge backend has a
    /// disk path to fall back to.
    pub fn webroot_dir(&self) -> PathBuf {
        self.root
            .join("webroot-storage")
            .join(".well-known")
            .join("acme-challenge")
    }

    /// Create every directory the monitor writes into.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.haproxy_config_dir())?;
        std::fs::create_dir_all(self.cert_dir())?;
        std::fs::create_dir_all(self.account_dir())?;
        std::fs::create_dir_all(self.webroot_dir())?;
        Ok(())
    }
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name), Ok(v) if v == "true" || v == "1")
}
