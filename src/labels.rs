//! Typed deployment descriptors parsed from container labels.
//!
//! Every deployable container carries a `turkis.*` label set describing the
//! application it belongs to. Parsing is strict: a container whose labels do
//! not fully validate is invisible to the monitor.

use std::collections::HashMap;

use crate::config::{DEFAULT_CONTAINER_PORT, DEFAULT_HEALTH_CHECK_PATH};
use crate::error::LabelError;

pub const LABEL_APP_NAME: &str = "turkis.appName";
pub const LABEL_DEPLOYMENT_ID: &str = "turkis.deployment-id";
pub const LABEL_IGNORE: &str = "turkis.ignore";
pub const LABEL_HEALTH_CHECK_PATH: &str = "turkis.health-check-path";
pub const LABEL_ACME_EMAIL: &str = "turkis.acme.email";
pub const LABEL_PORT: &str = "turkis.port";

/// Prefix for indexed canonical domain labels: `turkis.domain.<i>`.
/// Aliases nest under a canonical: `turkis.domain.<i>.alias.<j>`.
pub const LABEL_DOMAIN_PREFIX: &str = "turkis.domain.";

/// A canonical host name plus the aliases that 301-redirect to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub canonical: String,
    pub aliases: Vec<String>,
}

impl Domain {
    pub fn new(canonical: impl Into<String>, aliases: &[&str]) -> Self {
        Self {
            canonical: canonical.into(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Deployment descriptor decoded from one container's labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentLabels {
    pub app_name: String,
    /// 14-digit UTC timestamp; lexicographic order is chronological order.
    pub deployment_id: String,
    pub ignore: bool,
    pub health_check_path: String,
    pub acme_email: String,
    pub port: String,
    pub domains: Vec<Domain>,
}

impl DeploymentLabels {
    /// Parse a raw label map into a validated descriptor.
    pub fn parse(labels: &HashMap<String, String>) -> Result<Self, LabelError> {
        let app_name = required(labels, LABEL_APP_NAME)?;
        let deployment_id = required(labels, LABEL_DEPLOYMENT_ID)?;
        validate_deployment_id(&deployment_id)?;

        let acme_email = required(labels, LABEL_ACME_EMAIL)?;
        if !is_valid_email(&acme_email) {
            return Err(LabelError::InvalidEmail(acme_email));
        }

        let ignore = match labels.get(LABEL_IGNORE) {
            None => false,
            Some(v) => parse_bool(v).ok_or_else(|| LabelError::InvalidValue {
                label: LABEL_IGNORE.to_string(),
                value: v.clone(),
            })?,
        };

        let health_check_path = labels
            .get(LABEL_HEALTH_CHECK_PATH)
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_PATH.to_string());
        if !health_check_path.starts_with('/') {
            return Err(LabelError::InvalidValue {
                label: LABEL_HEALTH_CHECK_PATH.to_string(),
                value: health_check_path,
            });
        }

        let port = labels
            .get(LABEL_PORT)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTAINER_PORT.to_string());
        if port.is_empty() || port.parse::<u16>().is_err() {
            return Err(LabelError::InvalidValue {
                label: LABEL_PORT.to_string(),
                value: port,
            });
        }

        let domains = parse_domains(labels)?;

        Ok(Self {
            app_name,
            deployment_id,
            ignore,
            health_check_path,
            acme_email,
            port,
            domains,
        })
    }

    /// Encode the descriptor back into a label map. Domain indices are
    /// emitted densely from zero, so `parse(to_labels(d)) == d` for every
    /// valid descriptor.
    pub fn to_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(LABEL_APP_NAME.to_string(), self.app_name.clone());
        labels.insert(LABEL_DEPLOYMENT_ID.to_string(), self.deployment_id.clone());
        labels.insert(LABEL_IGNORE.to_string(), self.ignore.to_string());
        labels.insert(
            LABEL_HEALTH_CHECK_PATH.to_string(),
            self.health_check_path.clone(),
        );
        labels.insert(LABEL_ACME_EMAIL.to_string(), self.acme_email.clone());
        labels.insert(LABEL_PORT.to_string(), self.port.clone());

        for (i, domain) in self.domains.iter().enumerate() {
            labels.insert(format!("turkis.domain.{i}"), domain.canonical.clone());
            for (j, alias) in domain.aliases.iter().enumerate() {
                labels.insert(format!("turkis.domain.{i}.alias.{j}"), alias.clone());
            }
        }

        labels
    }

    /// Every host this deployment advertises: canonicals and aliases.
    pub fn all_hosts(&self) -> impl Iterator<Item = &str> {
        self.domains.iter().flat_map(|d| {
            std::iter::once(d.canonical.as_str()).chain(d.aliases.iter().map(String::as_str))
        })
    }
}

fn required(labels: &HashMap<String, String>, key: &'static str) -> Result<String, LabelError> {
    match labels.get(key) {
        Some(v) if !v.is_empty() => Ok(v.clone()),
        _ => Err(LabelError::MissingField(key)),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Collect `turkis.domain.<i>` / `turkis.domain.<i>.alias.<j>` labels.
/// Canonical indices may be sparse and are sorted ascending; aliases keep
/// their index order.
fn parse_domains(labels: &HashMap<String, String>) -> Result<Vec<Domain>, LabelError> {
    // canonical index -> (canonical, [(alias index, alias)])
    let mut by_index: HashMap<usize, (Option<String>, Vec<(usize, String)>)> = HashMap::new();

    for (key, value) in labels {
        let Some(rest) = key.strip_prefix(LABEL_DOMAIN_PREFIX) else {
            continue;
        };

        if let Some((index_part, alias_part)) = rest.split_once(".alias.") {
            let (Ok(i), Ok(j)) = (index_part.parse::<usize>(), alias_part.parse::<usize>()) else {
                continue;
            };
            if !is_valid_dns_name(value) {
                return Err(LabelError::InvalidValue {
                    label: key.clone(),
                    value: value.clone(),
                });
            }
            by_index.entry(i).or_default().1.push((j, value.clone()));
        } else {
            let Ok(i) = rest.parse::<usize>() else {
                continue;
            };
            if value.is_empty() || !is_valid_dns_name(value) {
                return Err(LabelError::InvalidValue {
                    label: key.clone(),
                    value: value.clone(),
                });
            }
            by_index.entry(i).or_default().0 = Some(value.clone());
        }
    }

    if by_index.is_empty() {
        return Err(LabelError::NoDomains);
    }

    let mut indices: Vec<usize> = by_index.keys().copied().collect();
    indices.sort_unstable();

    let mut domains = Vec::with_capacity(indices.len());
    for i in indices {
        let (canonical, mut aliases) = by_index.remove(&i).unwrap_or_default();
        let Some(canonical) = canonical else {
            // Aliases without a canonical at the same index.
            return Err(LabelError::InvalidValue {
                label: format!("turkis.domain.{i}"),
                value: String::new(),
            });
        };

        aliases.sort_by_key(|(j, _)| *j);
        let aliases: Vec<String> = aliases.into_iter().map(|(_, alias)| alias).collect();

        if aliases.iter().any(|a| *a == canonical) {
            return Err(LabelError::InvalidValue {
                label: format!("turkis.domain.{i}"),
                value: canonical,
            });
        }

        domains.push(Domain { canonical, aliases });
    }

    Ok(domains)
}

/// The deployment id is a 14-digit `YYYYMMDDhhmmss` timestamp. Field ranges
/// are checked so that ids sort chronologically.
fn validate_deployment_id(id: &str) -> Result<(), LabelError> {
    if id.len() != 14 || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LabelError::BadTimestamp(id.to_string()));
    }

    let field = |range: std::ops::Range<usize>| id[range].parse::<u32>().unwrap_or(u32::MAX);
    let month = field(4..6);
    let day = field(6..8);
    let hour = field(8..10);
    let minute = field(10..12);
    let second = field(12..14);

    let in_range = (1..=12).contains(&month)
        && (1..=31).contains(&day)
        && hour < 24
        && minute < 60
        && second < 60;
    if !in_range {
        return Err(LabelError::BadTimestamp(id.to_string()));
    }
    Ok(())
}

/// Syntactic DNS-name check: dot-separated labels of alphanumerics and
/// hyphens, no hyphen at a label edge, 253 bytes total.
fn is_valid_dns_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// Lightweight address check: exactly one `@`, a non-empty local part and a
/// syntactically valid domain.
fn is_valid_email(email: &str) -> bool {
    let mut parts = email.splitn(2, '@');
    let (Some(local), Some(domain)) = (parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty()
        && !local.contains(char::is_whitespace)
        && !domain.contains('@')
        && is_valid_dns_name(domain)
}
