//! Rule store endpoint checks
//!
//! The service fetches rules from a configured URL with a bearer credential,
//! so the URL is checked before any request is made: HTTPS only, and never a
//! loopback, private, link-local or cloud metadata address unless the
//! deployment explicitly opts into insecure endpoints.

use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Reasons an endpoint is refused
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid rule store URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("scheme '{0}' is not allowed for the rule store, use https")]
    InvalidScheme(String),

    #[error("rule store host '{0}' is not allowed")]
    BlockedHost(String),

    #[error("rule store host '{0}' is not in the allowed domains")]
    NotAllowlisted(String),

    #[error("rule store URL has no host")]
    MissingHost,
}

/// Hosts that are refused even with private addresses allowed
const METADATA_HOSTS: &[&str] = &[
    "metadata.google.internal",
    "metadata.goog",
    "169.254.169.254",
    "fd00:ec2::254",
];

const LOOPBACK_HOSTS: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
];

/// What a rule store URL may point at
#[derive(Debug, Clone, Default)]
pub struct EndpointPolicy {
    /// Accept plain `http`
    pub allow_http: bool,

    /// Accept loopback and private-range hosts
    pub allow_private_hosts: bool,

    /// When set, the host must be one of these domains or a subdomain
    pub allowed_domains: Option<Vec<String>>,
}

impl EndpointPolicy {
    /// Policy for `allow_insecure` deployments: plain HTTP and local hosts
    pub fn insecure() -> Self {
        Self {
            allow_http: true,
            allow_private_hosts: true,
            allowed_domains: None,
        }
    }

    /// Policy matching the `allow_insecure` setting
    pub fn from_allow_insecure(allow_insecure: bool) -> Self {
        if allow_insecure {
            Self::insecure()
        } else {
            Self::default()
        }
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Parse and check a rule store URL
pub fn validate_endpoint(raw: &str, policy: &EndpointPolicy) -> Result<Url, EndpointError> {
    let url = Url::parse(raw)?;

    match url.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        scheme => return Err(EndpointError::InvalidScheme(scheme.to_string())),
    }

    let host = url.host_str().ok_or(EndpointError::MissingHost)?;
    let host_lower = host.trim_matches(|c| c == '[' || c == ']').to_lowercase();

    if METADATA_HOSTS.iter().any(|blocked| host_matches(&host_lower, blocked)) {
        return Err(EndpointError::BlockedHost(host.to_string()));
    }

    if !policy.allow_private_hosts
        && LOOPBACK_HOSTS.iter().any(|blocked| host_matches(&host_lower, blocked))
    {
        return Err(EndpointError::BlockedHost(host.to_string()));
    }

    if let Ok(ip) = host_lower.parse::<IpAddr>() {
        if is_link_local(&ip) {
            return Err(EndpointError::BlockedHost(host.to_string()));
        }
        if !policy.allow_private_hosts && (ip.is_loopback() || is_private(&ip)) {
            return Err(EndpointError::BlockedHost(host.to_string()));
        }
    }

    if let Some(allowed) = &policy.allowed_domains {
        let listed = allowed
            .iter()
            .any(|domain| host_matches(&host_lower, &domain.to_lowercase()));
        if !listed {
            return Err(EndpointError::NotAllowlisted(host.to_string()));
        }
    }

    Ok(url)
}

/// RFC 1918, carrier-grade NAT, 0.0.0.0/8 and IPv6 unique local addresses
fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_private() || (a == 100 && (b & 0xC0) == 64) || a == 0
        }
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// 169.254.0.0/16 and fe80::/10
fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_endpoint_is_accepted() {
        let url = validate_endpoint("https://rules.example.com/v1/rules", &EndpointPolicy::default())
            .unwrap();
        assert_eq!(url.path(), "/v1/rules");
    }

    #[test]
    fn test_plain_http_requires_opt_in() {
        let strict = EndpointPolicy::default();
        assert!(matches!(
            validate_endpoint("http://rules.example.com", &strict),
            Err(EndpointError::InvalidScheme(_))
        ));
        assert!(validate_endpoint("http://rules.example.com", &EndpointPolicy::insecure()).is_ok());
        assert!(matches!(
            validate_endpoint("ftp://rules.example.com", &EndpointPolicy::insecure()),
            Err(EndpointError::InvalidScheme(_))
        ));
    }

    #[test]
    fn test_local_and_private_hosts_are_blocked() {
        let strict = EndpointPolicy::default();
        for raw in [
            "https://localhost:8443",
            "https://127.0.0.1",
            "https://10.1.2.3",
            "https://172.16.0.1",
            "https://192.168.1.10",
            "https://100.64.0.1",
            "https://[::1]",
            "https://[fd12::1]",
        ] {
            assert!(
                matches!(validate_endpoint(raw, &strict), Err(EndpointError::BlockedHost(_))),
                "{} should be blocked",
                raw
            );
        }
    }

    #[test]
    fn test_insecure_policy_allows_local_hosts_but_not_metadata() {
        let insecure = EndpointPolicy::insecure();
        assert!(validate_endpoint("http://127.0.0.1:9000/rules", &insecure).is_ok());
        assert!(validate_endpoint("http://localhost:9000/rules", &insecure).is_ok());

        for raw in [
            "http://169.254.169.254/latest/meta-data/",
            "http://metadata.google.internal/computeMetadata",
            "http://[fe80::1]",
        ] {
            assert!(validate_endpoint(raw, &insecure).is_err(), "{} should be blocked", raw);
        }
    }

    #[test]
    fn test_allowlist() {
        let policy = EndpointPolicy {
            allowed_domains: Some(vec!["governance.example.com".to_string()]),
            ..EndpointPolicy::default()
        };

        assert!(validate_endpoint("https://governance.example.com/rules", &policy).is_ok());
        assert!(validate_endpoint("https://eu.governance.example.com/rules", &policy).is_ok());
        assert!(matches!(
            validate_endpoint("https://evil.example.com/rules", &policy),
            Err(EndpointError::NotAllowlisted(_))
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            validate_endpoint("not a url", &EndpointPolicy::default()),
            Err(EndpointError::InvalidUrl(_))
        ));
    }
}
