use std::collections::BTreeSet;

use thiserror::Error;
use url::Url;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("domain is empty")]
    Empty,
    #[error("'{0}' is not a valid domain")]
    Invalid(String),
}

/// Brings a host name into the form used as a ledger key: lowercase, no trailing dot, no port and
/// no leading `www.`. Accepts a full url as well, in which case its host is used.
pub fn normalize_domain(raw: &str) -> Result<String, DomainError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DomainError::Empty);
    }

    let host = if raw.contains("://") {
        Url::parse(raw)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .ok_or_else(|| DomainError::Invalid(raw.to_string()))?
    } else {
        let without_path = raw.split(['/', '?', '#']).next().unwrap_or_default();
        strip_port(without_path).to_string()
    };

    let host = host.to_lowercase();
    let mut host = host.strip_prefix("www.").map(str::to_string).unwrap_or(host);
    while host.ends_with('.') {
        host.pop();
    }

    if host.is_empty() {
        return Err(DomainError::Empty);
    }
    if !is_valid_host(&host) {
        return Err(DomainError::Invalid(raw.to_string()));
    }
    Ok(host)
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn is_valid_host(host: &str) -> bool {
    host.len() <= MAX_DOMAIN_LEN
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= MAX_LABEL_LEN
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

/// Domain of a page that may accrue time. Only http(s) pages with a host qualify.
pub fn trackable_domain(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    normalize_domain(parsed.host_str()?).ok()
}

/// Domains that never accrue time. An entry also covers all of its subdomains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    domains: BTreeSet<String>,
}

impl ExclusionSet {
    pub fn new(domains: impl IntoIterator<Item = String>) -> Self {
        Self {
            domains: domains.into_iter().collect(),
        }
    }

    pub fn is_excluded(&self, domain: &str) -> bool {
        self.domains.iter().any(|excluded| {
            domain == excluded
                || domain
                    .strip_suffix(excluded.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Returns whether the domain was newly added.
    pub fn insert(&mut self, domain: String) -> bool {
        self.domains.insert(domain)
    }

    pub fn remove(&mut self, domain: &str) -> bool {
        self.domains.remove(domain)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.domains.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
