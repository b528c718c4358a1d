//! Request classification.
//!
//! Classification is an ordered rule table: the first rule whose matcher
//! accepts the request decides its partition and strategy.

use std::fmt;

use offkit_net::HostPattern;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::ClassifierConfig;
use crate::partition::PartitionKey;
use crate::request::{DestinationType, RequestDescriptor};

/// How a routed request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    CacheFirst,
    NetworkFirstThenCache,
    NetworkFirstWithShortTtlFallback,
    NetworkFirstWithCacheFallback,
    StaleWhileRevalidate,
    NavigationFallback,
    NetworkOnly,
}

/// Outcome of classifying a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classification {
    /// Straight to the network, no store interaction.
    Bypass,
    Route {
        partition: PartitionKey,
        strategy: Strategy,
    },
}

impl Classification {
    pub const fn route(partition: PartitionKey, strategy: Strategy) -> Self {
        Classification::Route { partition, strategy }
    }
}

/// Predicate of one rule.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Any method other than GET.
    NonGet,
    /// Top-level navigation.
    Navigation,
    /// Image destination, or an image extension.
    Image { extensions: Vec<String> },
    /// Path begins with a prefix.
    PathPrefix(String),
    /// Last path segment has one of these extensions.
    Extension(Vec<String>),
    /// Host matches one of these patterns.
    Host(Vec<HostPattern>),
    /// Always matches.
    Any,
}

impl RuleMatcher {
    pub fn matches(&self, request: &RequestDescriptor) -> bool {
        match self {
            RuleMatcher::NonGet => !request.is_get(),
            RuleMatcher::Navigation => request.is_navigation(),
            RuleMatcher::Image { extensions } => {
                request.destination() == DestinationType::Image
                    || has_extension(request, extensions)
            }
            RuleMatcher::PathPrefix(prefix) => request.path().starts_with(prefix.as_str()),
            RuleMatcher::Extension(extensions) => has_extension(request, extensions),
            RuleMatcher::Host(patterns) => request
                .url()
                .host_str()
                .is_some_and(|host| patterns.iter().any(|p| p.matches_host(host))),
            RuleMatcher::Any => true,
        }
    }
}

fn has_extension(request: &RequestDescriptor, extensions: &[String]) -> bool {
    request
        .extension()
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
}

/// One entry of the rule table.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: &'static str,
    pub matcher: RuleMatcher,
    pub outcome: Classification,
}

impl Rule {
    pub fn new(name: &'static str, matcher: RuleMatcher, outcome: Classification) -> Self {
        Self {
            name,
            matcher,
            outcome,
        }
    }
}

/// Which rule classified a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule: &'static str,
    pub classification: Classification,
}

impl fmt::Display for RuleMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.classification {
            Classification::Bypass => write!(f, "{} -> bypass", self.rule),
            Classification::Route { partition, strategy } => {
                write!(f, "{} -> {partition}/{strategy:?}", self.rule)
            }
        }
    }
}

/// Ordered classification rules.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    rules: Vec<Rule>,
}

impl RequestClassifier {
    /// Build the standard table from configuration.
    pub fn new(config: &ClassifierConfig) -> Self {
        let lower = |items: &[String]| items.iter().map(|s| s.to_ascii_lowercase()).collect();
        let rules = vec![
            Rule::new("non-get", RuleMatcher::NonGet, Classification::Bypass),
            Rule::new(
                "navigation",
                RuleMatcher::Navigation,
                Classification::route(PartitionKey::Runtime, Strategy::NavigationFallback),
            ),
            Rule::new(
                "image",
                RuleMatcher::Image {
                    extensions: lower(&config.image_extensions),
                },
                Classification::route(PartitionKey::Images, config.image_strategy),
            ),
            Rule::new(
                "api",
                RuleMatcher::PathPrefix(config.api_prefix.clone()),
                Classification::route(PartitionKey::Api, Strategy::NetworkFirstWithShortTtlFallback),
            ),
            Rule::new(
                "static-asset",
                RuleMatcher::Extension(lower(&config.static_extensions)),
                Classification::route(PartitionKey::Runtime, config.static_strategy),
            ),
            Rule::new(
                "bypass-host",
                RuleMatcher::Host(config.bypass_hosts.iter().map(|h| HostPattern::parse(h)).collect()),
                Classification::Bypass,
            ),
            Rule::new(
                "default",
                RuleMatcher::Any,
                Classification::route(PartitionKey::Runtime, Strategy::NetworkFirstWithCacheFallback),
            ),
        ];
        Self { rules }
    }

    /// Build a classifier from an explicit table.
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn classify(&self, request: &RequestDescriptor) -> Classification {
        self.explain(request).classification
    }

    /// Classify and report the deciding rule. A table without a catch-all
    /// that matches nothing bypasses.
    pub fn explain(&self, request: &RequestDescriptor) -> RuleMatch {
        for rule in &self.rules {
            let hit = rule.matcher.matches(request);
            trace!(rule = rule.name, hit, url = %request.url(), "Rule evaluated");
            if hit {
                return RuleMatch {
                    rule: rule.name,
                    classification: rule.outcome,
                };
            }
        }
        RuleMatch {
            rule: "none",
            classification: Classification::Bypass,
        }
    }
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}
