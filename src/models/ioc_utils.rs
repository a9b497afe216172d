//! Indicator type detection and value normalization

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::models::IocType;

static CVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^CVE-\d{4}-\d{4,}$").unwrap());

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s.]+$").unwrap());

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$").unwrap()
});

/// Detect the indicator type from a raw value string
pub fn detect_ioc_type(value: &str) -> Option<IocType> {
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return None;
    }

    if CVE_RE.is_match(trimmed) {
        return Some(IocType::Cve);
    }

    // Hash lengths: MD5=32, SHA1=40, SHA256=64 hex chars
    if matches!(trimmed.len(), 32 | 40 | 64)
        && trimmed.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Some(IocType::Hash);
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Some(IocType::Url);
    }

    if EMAIL_RE.is_match(trimmed) {
        return Some(IocType::Email);
    }

    if trimmed.parse::<Ipv4Addr>().is_ok() || trimmed.parse::<Ipv6Addr>().is_ok() {
        return Some(IocType::Ip);
    }

    // CIDR ranges count as IPs
    if let Some((net, mask)) = trimmed.split_once('/') {
        if mask.parse::<u8>().is_ok()
            && (net.parse::<Ipv4Addr>().is_ok() || net.parse::<Ipv6Addr>().is_ok())
        {
            return Some(IocType::Ip);
        }
    }

    if DOMAIN_RE.is_match(trimmed) {
        return Some(IocType::Domain);
    }

    None
}

/// Normalize an indicator value for its type. Lowercase everywhere
/// except CVE ids and URL paths, which are case-sensitive.
pub fn normalize_ioc(value: &str, ioc_type: IocType) -> String {
    let trimmed = value.trim();

    match ioc_type {
        IocType::Cve => trimmed.to_uppercase(),
        IocType::Url => match Url::parse(trimmed) {
            // Url lowercases scheme and host; path/query stay as-is
            Ok(url) => url.to_string(),
            Err(_) => trimmed.to_lowercase(),
        },
        IocType::Ip | IocType::Domain | IocType::Hash | IocType::Email => {
            trimmed.to_lowercase()
        }
    }
}
