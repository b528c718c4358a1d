//! Host patterns for requests that must never be intercepted.

use tracing::trace;
use url::Url;

/// How a [`HostPattern`] compares against a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Exact host match.
    Exact,
    /// The domain itself or any subdomain of it.
    Suffix,
    /// Host contains the substring.
    Contains,
}

/// Pattern matched against a request host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Lowercased pattern string.
    pub pattern: String,
}

impl HostPattern {
    /// Create an exact match pattern.
    pub fn exact(host: &str) -> Self {
        Self {
            pattern_type: PatternType::Exact,
            pattern: host.to_ascii_lowercase(),
        }
    }

    /// Create a domain pattern matching the domain and its subdomains.
    pub fn suffix(domain: &str) -> Self {
        Self {
            pattern_type: PatternType::Suffix,
            pattern: domain.trim_start_matches('.').to_ascii_lowercase(),
        }
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self {
            pattern_type: PatternType::Contains,
            pattern: substring.to_ascii_lowercase(),
        }
    }

    /// Parse the config notation: `*.stripe.com` is a domain pattern,
    /// `~storage` a substring pattern, anything else an exact host.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        if let Some(domain) = spec.strip_prefix("*.") {
            Self::suffix(domain)
        } else if let Some(needle) = spec.strip_prefix('~') {
            Self::contains(needle)
        } else {
            Self::exact(spec)
        }
    }

    /// Check if a host matches this pattern.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let matched = match self.pattern_type {
            PatternType::Exact => host == self.pattern,
            PatternType::Suffix => {
                host == self.pattern
                    || host
                        .strip_suffix(self.pattern.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            }
            PatternType::Contains => host.contains(&self.pattern),
        };
        trace!(host = %host, pattern = %self.pattern, matched, "Host pattern check");
        matched
    }

    /// Check if a URL's host matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| self.matches_host(host))
    }
}
