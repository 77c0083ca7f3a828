//! ACME certificate management.
//!
//! Keeps one certificate bundle per canonical domain (aliases ride along as
//! SANs), renews ahead of expiry and hot-reloads fresh bundles into HAProxy
//! through the admin socket. Validation is HTTP-01 only: tokens go into the
//! shared [`ChallengeStore`] and HAProxy forwards challenge traffic to the
//! embedded responder.
//!
//! Account keys are per contact email, persisted once under
//! `cert-storage/accounts/` with restrictive permissions, and registered at
//! most once per process lifetime.

use std::collections::{HashMap, HashSet};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::challenge::ChallengeStore;
use crate::config::{Settings, RENEWAL_INTERVAL, RENEWAL_THRESHOLD_DAYS, SHUTDOWN_DEADLINE};
use crate::error::AcmeError;
use crate::haproxy::AdminClient;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// One domain the manager is responsible for.
#[derive(Debug, Clone)]
struct ManagedDomain {
    aliases: Vec<String>,
    email: String,
    /// At most one obtain runs per canonical at any time.
    obtaining: bool,
}

pub struct CertificateManager {
    cert_dir: PathBuf,
    account_dir: PathBuf,
    staging: bool,
    store: ChallengeStore,
    admin: AdminClient,
    known: RwLock<HashMap<String, ManagedDomain>>,
    /// Registered accounts, one per contact email, cached for the process
    /// lifetime.
    accounts: Mutex<HashMap<String, Account>>,
    active_workers: AtomicUsize,
}

impl CertificateManager {
    /// Failing to provision the certificate or account directories is
    /// fatal: without them no certificate can ever be persisted.
    pub fn new(
        settings: &Settings,
        store: ChallengeStore,
        admin: AdminClient,
    ) -> anyhow::Result<Arc<Self>> {
        let cert_dir = settings.cert_dir();
        let account_dir = settings.account_dir();
        std::fs::create_dir_all(&cert_dir)
            .with_context(|| format!("failed to create {}", cert_dir.display()))?;
        std::fs::create_dir_all(&account_dir)
            .with_context(|| format!("failed to create {}", account_dir.display()))?;

        // Account keys must be persistable before any order is placed.
        let probe = account_dir.join(".probe");
        std::fs::write(&probe, b"")
            .with_context(|| format!("account key directory {} is not writable", account_dir.display()))?;
        let _ = std::fs::remove_file(&probe);

        Ok(Arc::new(Self {
            cert_dir,
            account_dir,
            staging: settings.tls_staging,
            store,
            admin,
            known: RwLock::new(HashMap::new()),
            accounts: Mutex::new(HashMap::new()),
            active_workers: AtomicUsize::new(0),
        }))
    }

    fn directory_url(&self) -> &'static str {
        if self.staging {
            LetsEncrypt::Staging.url()
        } else {
            LetsEncrypt::Production.url()
        }
    }

    /// Path of the PEM bundle HAProxy loads for a canonical domain.
    pub fn bundle_path(&self, canonical: &str) -> PathBuf {
        self.cert_dir.join(format!("{canonical}.pem"))
    }

    fn chain_path(&self, canonical: &str) -> PathBuf {
        self.cert_dir.join(format!("{canonical}.crt"))
    }

    fn key_path(&self, canonical: &str) -> PathBuf {
        self.cert_dir.join(format!("{canonical}.key"))
    }

    /// Start managing a canonical domain. Returns true when the domain is
    /// new or its alias set changed, i.e. when a fresh obtain is warranted.
    pub async fn add_domain(&self, canonical: &str, aliases: &[String], email: &str) -> bool {
        let mut known = self.known.write().await;
        match known.get_mut(canonical) {
            Some(entry) => {
                let changed = entry.aliases != aliases;
                entry.aliases = aliases.to_vec();
                entry.email = email.to_string();
                changed
            }
            None => {
                info!(canonical, aliases = aliases.len(), "managing new domain");
                known.insert(
                    canonical.to_string(),
                    ManagedDomain {
                        aliases: aliases.to_vec(),
                        email: email.to_string(),
                        obtaining: false,
                    },
                );
                true
            }
        }
    }

    /// Stop managing a canonical domain. On-disk files stay; they are
    /// picked up again if the domain ever comes back.
    pub async fn remove_domain(&self, canonical: &str) {
        if self.known.write().await.remove(canonical).is_some() {
            info!(canonical, "stopped managing domain, files kept on disk");
        }
    }

    pub async fn known_canonicals(&self) -> HashSet<String> {
        self.known.read().await.keys().cloned().collect()
    }

    /// Kick an asynchronous obtain for a canonical, unless one is already
    /// in flight for it.
    pub fn spawn_obtain(self: &Arc<Self>, canonical: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut known = manager.known.write().await;
                match known.get_mut(&canonical) {
                    Some(entry) if !entry.obtaining => entry.obtaining = true,
                    Some(_) => {
                        debug!(canonical, "obtain already in flight");
                        return;
                    }
                    None => return,
                }
            }

            manager.active_workers.fetch_add(1, Ordering::SeqCst);
            let result = manager.obtain(&canonical).await;
            manager.active_workers.fetch_sub(1, Ordering::SeqCst);

            if let Some(entry) = manager.known.write().await.get_mut(&canonical) {
                entry.obtaining = false;
            }

            if let Err(e) = result {
                let kind = AcmeError::classify(&e);
                error!(canonical, error = %kind, "failed to obtain certificate");
            }
        });
    }

    /// Obtain (or renew) the certificate for one canonical domain and
    /// hot-reload it into HAProxy.
    async fn obtain(&self, canonical: &str) -> anyhow::Result<()> {
        let (aliases, email) = {
            let known = self.known.read().await;
            let entry = known
                .get(canonical)
                .with_context(|| format!("domain '{canonical}' is no longer managed"))?;
            (entry.aliases.clone(), entry.email.clone())
        };

        let account = self.ensure_account(&email).await?;

        let names: Vec<String> = std::iter::once(canonical.to_string())
            .chain(aliases.iter().cloned())
            .collect();
        let identifiers: Vec<Identifier> =
            names.iter().map(|n| Identifier::Dns(n.clone())).collect();

        info!(canonical, sans = ?aliases, "requesting certificate");
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut tokens = Vec::new();
        let result = self.drive_order(&mut order, canonical, &names, &mut tokens).await;
        for token in &tokens {
            self.store.remove(token).await;
        }
        let (chain_pem, key_pem) = result?;

        self.write_cert_files(canonical, &chain_pem, &key_pem)?;
        info!(canonical, "certificate written");

        if let Err(e) = self
            .admin
            .install_certificate(&self.bundle_path(canonical), canonical)
            .await
        {
            // Files are on disk; the periodic resync converges HAProxy.
            error!(canonical, error = %e, "failed to hot-reload certificate into HAProxy");
        }

        Ok(())
    }

    /// Walk an order through validation, finalization and issuance.
    async fn drive_order(
        &self,
        order: &mut Order,
        canonical: &str,
        names: &[String],
        tokens: &mut Vec<String>,
    ) -> anyhow::Result<(String, String)> {
        let authorizations = order.authorizations().await?;

        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .with_context(|| format!("no HTTP-01 challenge offered for {identifier}"))?;

            let key_auth = order.key_authorization(challenge);
            debug!(domain = %identifier, token = %challenge.token, "publishing HTTP-01 challenge");
            self.store
                .set(challenge.token.clone(), key_auth.as_str().to_string())
                .await;
            tokens.push(challenge.token.clone());

            order.set_challenge_ready(&challenge.url).await?;
            self.await_authorization(order, &identifier).await?;
        }

        // Wait for the order to leave pending/processing.
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("order for {canonical} became invalid"),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("order for {canonical} not ready in time");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        // CSR: canonical is the CN and SAN-0, aliases follow.
        let mut params = CertificateParams::new(names.to_vec())?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, canonical.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let chain_pem: String = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("order valid but no certificate returned for {canonical}");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("certificate for {canonical} not issued in time");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                status => anyhow::bail!("unexpected order status for {canonical}: {status:?}"),
            }
        };

        Ok((chain_pem, private_key.serialize_pem()))
    }

    /// Poll one authorization until it turns valid.
    async fn await_authorization(&self, order: &mut Order, identifier: &str) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await?;

            let authorizations = order.authorizations().await?;
            let current = authorizations
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == identifier));

            match current.map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %identifier, "authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("authorization failed for {identifier}");
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("authorization timeout for {identifier}");
                    }
                    debug!(domain = %identifier, attempt = attempts, "waiting for authorization");
                }
                Some(status) => {
                    debug!(domain = %identifier, status = ?status, "authorization status");
                }
                None => anyhow::bail!("authorization not found for {identifier}"),
            }
        }
    }

    /// Load or create the ACME account for a contact email. Credentials are
    /// persisted under `accounts/<sanitized-email>.key` (0600); the embedded
    /// account URL lets later runs skip registration.
    async fn ensure_account(&self, email: &str) -> anyhow::Result<Account> {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.get(email) {
            return Ok(account.clone());
        }

        let path = self
            .account_dir
            .join(format!("{}.key", sanitize_email(email)));

        let account = if path.exists() {
            debug!(path = %path.display(), "loading existing ACME account");
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let credentials: AccountCredentials = serde_json::from_str(&data)
                .with_context(|| format!("corrupt account credentials in {}", path.display()))?;
            Account::from_credentials(credentials).await?
        } else {
            info!(email, "creating new ACME account");
            let (account, credentials) = Account::create(
                &NewAccount {
                    contact: &[&format!("mailto:{email}")],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url(),
                None,
            )
            .await?;

            let data = serde_json::to_string_pretty(&credentials)?;
            write_file_atomic(&path, data.as_bytes(), 0o600)
                .with_context(|| format!("failed to persist account key {}", path.display()))?;
            info!(path = %path.display(), "ACME account credentials saved");
            account
        };

        accounts.insert(email.to_string(), account.clone());
        Ok(account)
    }

    /// Write `<canonical>.crt`, `.key` and the concatenated `.pem` bundle,
    /// each atomically and with its required mode.
    fn write_cert_files(
        &self,
        canonical: &str,
        chain_pem: &str,
        key_pem: &str,
    ) -> anyhow::Result<()> {
        write_file_atomic(&self.chain_path(canonical), chain_pem.as_bytes(), 0o644)?;
        write_file_atomic(&self.key_path(canonical), key_pem.as_bytes(), 0o600)?;

        let bundle = format!("{chain_pem}\n{key_pem}");
        write_file_atomic(&self.bundle_path(canonical), bundle.as_bytes(), 0o600)?;
        Ok(())
    }

    /// Renewal loop: every 24 h walk the managed set and re-obtain anything
    /// missing or expiring within the threshold. Runs one check at startup.
    pub async fn run_renewal(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        self.check_renewals().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEWAL_INTERVAL) => {
                    self.check_renewals().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("certificate renewal loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn check_renewals(self: &Arc<Self>) {
        let canonicals = self.known_canonicals().await;
        for canonical in canonicals {
            let chain = self.chain_path(&canonical);
            if !chain.exists() {
                info!(canonical, "no certificate on disk, obtaining");
                self.spawn_obtain(canonical);
            } else if !cert_valid_for_days(&chain, RENEWAL_THRESHOLD_DAYS) {
                info!(canonical, "certificate expires soon, renewing");
                self.spawn_obtain(canonical);
            }
        }
    }

    /// Re-install every PEM bundle on disk into the running HAProxy. Run
    /// after proxy restarts and on the periodic certificate-sync tick.
    pub async fn sync_installed(&self) {
        let entries = match std::fs::read_dir(&self.cert_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, dir = %self.cert_dir.display(), "failed to read certificate directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let Some(canonical) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };

            if let Err(e) = self.admin.install_certificate(&path, &canonical).await {
                warn!(canonical, error = %e, "failed to re-install certificate");
            }
        }
    }

    /// Wait for in-flight obtain workers, up to the shutdown deadline.
    pub async fn shutdown_drain(&self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        while self.active_workers.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active_workers.load(Ordering::SeqCst),
                    "shutdown deadline reached with certificate workers still running"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        debug!("all certificate workers drained");
    }
}

/// True when the leaf certificate in `path` is valid for at least `days`
/// more days.
pub fn cert_valid_for_days(path: &Path, days: u64) -> bool {
    use x509_parser::prelude::*;

    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read certificate");
            return false;
        }
    };

    let Some(Ok(leaf)) = rustls_pemfile::certs(&mut BufReader::new(&data[..])).next() else {
        warn!(path = %path.display(), "no certificate found in file");
        return false;
    };

    let parsed = match X509Certificate::from_der(leaf.as_ref()) {
        Ok((_, parsed)) => parsed,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse X.509 certificate");
            return false;
        }
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let expiry = parsed.validity().not_after.timestamp();

    let remaining = expiry - now;
    if remaining < 0 {
        return false;
    }
    (remaining as u64) / (24 * 60 * 60) >= days
}

/// Email -> safe filename: keep alphanumerics and hyphens, everything else
/// becomes an underscore.
fn sanitize_email(email: &str) -> String {
    email
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Write a file atomically with the given mode: tmp sibling, fsync, rename.
fn write_file_atomic(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");

    {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options
            .open(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        std::io::Write::write_all(&mut file, contents)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} over {}", tmp_path.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> Arc<CertificateManager> {
        let settings = Settings {
            root: root.to_path_buf(),
            docker_host: None,
            admin_socket: PathBuf::from("/tmp/none.sock"),
            dry_run: true,
            tls_staging: true,
            no_tls: false,
        };
        CertificateManager::new(
            &settings,
            ChallengeStore::new(),
            AdminClient::new(&settings.admin_socket, true),
        )
        .unwrap()
    }

    #[test]
    fn test_sanitize_email() {
        assert_eq!(sanitize_email("ops@example.com"), "ops_example_com");
        assert_eq!(sanitize_email("a+b@ex.io"), "a_b_ex_io");
        assert_eq!(sanitize_email("plain-name"), "plain-name");
    }

    #[tokio::test]
    async fn test_add_remove_domains() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());

        assert!(
            manager
                .add_domain("foo.example.com", &["www.foo.example.com".to_string()], "a@b.example")
                .await
        );
        // Same domain, same aliases: nothing new.
        assert!(
            !manager
                .add_domain("foo.example.com", &["www.foo.example.com".to_string()], "a@b.example")
                .await
        );
        // Alias set changed: a fresh obtain is warranted.
        assert!(manager.add_domain("foo.example.com", &[], "a@b.example").await);

        assert_eq!(
            manager.known_canonicals().await,
            HashSet::from(["foo.example.com".to_string()])
        );

        manager.remove_domain("foo.example.com").await;
        assert!(manager.known_canonicals().await.is_empty());
    }

    #[test]
    fn test_write_file_atomic_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("secret.key");
        write_file_atomic(&path, b"key material", 0o600).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"key material");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_write_cert_files_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());

        manager
            .write_cert_files("foo.example.com", "CHAIN", "KEY")
            .unwrap();

        let cert_dir = tmp.path().join("cert-storage");
        assert_eq!(
            std::fs::read_to_string(cert_dir.join("foo.example.com.crt")).unwrap(),
            "CHAIN"
        );
        assert_eq!(
            std::fs::read_to_string(cert_dir.join("foo.example.com.key")).unwrap(),
            "KEY"
        );
        assert_eq!(
            std::fs::read_to_string(cert_dir.join("foo.example.com.pem")).unwrap(),
            "CHAIN\nKEY"
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = |name: &str| {
                std::fs::metadata(cert_dir.join(name))
                    .unwrap()
                    .permissions()
                    .mode()
                    & 0o777
            };
            assert_eq!(mode("foo.example.com.crt"), 0o644);
            assert_eq!(mode("foo.example.com.key"), 0o600);
            assert_eq!(mode("foo.example.com.pem"), 0o600);
        }
    }

    #[test]
    fn test_cert_validity_check() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("leaf.crt");

        // rcgen's default validity extends centuries into the future.
        let cert = rcgen::generate_simple_self_signed(vec!["foo.example.com".to_string()]).unwrap();
        std::fs::write(&path, cert.cert.pem()).unwrap();

        assert!(cert_valid_for_days(&path, RENEWAL_THRESHOLD_DAYS));
        assert!(!cert_valid_for_days(&path, 100_000_000));

        let missing = tmp.path().join("absent.crt");
        assert!(!cert_valid_for_days(&missing, 1));

        let garbage = tmp.path().join("garbage.crt");
        std::fs::write(&garbage, "not a pem").unwrap();
        assert!(!cert_valid_for_days(&garbage, 1));
    }

    #[tokio::test]
    async fn test_shutdown_drain_with_no_workers() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());
        // Returns immediately when nothing is in flight.
        manager.shutdown_drain().await;
    }
}
