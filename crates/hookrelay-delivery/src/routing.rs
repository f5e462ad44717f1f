//! Rule-based destination resolution.
//!
//! Pure functions over a `RoutingConfig` snapshot. Rules are evaluated in
//! declaration order and every matching rule contributes a destination, so
//! one event can fan out to several targets.

use std::collections::HashSet;

use hookrelay_core::models::{Destination, RoutingConfig};

/// Problem found in a routing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingIssue {
    /// A rule names a destination that does not exist.
    UnknownDestination {
        /// Index of the rule in declaration order.
        rule_index: usize,
        /// Name that could not be resolved.
        destination: String,
    },
    /// Two destinations share a name; the first one wins.
    DuplicateDestination {
        /// Shared name.
        name: String,
    },
    /// A destination URL is not absolute.
    InvalidUrl {
        /// Destination name.
        name: String,
        /// Offending URL.
        url: String,
    },
    /// A health probe target cannot be probed.
    InvalidProbe {
        /// Destination name.
        name: String,
        /// Validation message.
        reason: String,
    },
}

impl std::fmt::Display for RoutingIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownDestination { rule_index, destination } => {
                write!(f, "rule #{rule_index} targets unknown destination '{destination}'")
            },
            Self::DuplicateDestination { name } => {
                write!(f, "destination '{name}' is defined twice")
            },
            Self::InvalidUrl { name, url } => {
                write!(f, "destination '{name}' has non-absolute url '{url}'")
            },
            Self::InvalidProbe { name, reason } => {
                write!(f, "destination '{name}' has an invalid health probe: {reason}")
            },
        }
    }
}

/// Resolves the destinations that should receive an event from `source`.
///
/// Matching rules contribute in declaration order. A destination matched by
/// several rules appears once, at its first position. Unknown destination
/// names and destinations without an absolute URL are skipped; both are
/// reported once per snapshot by `warn_issues`.
pub fn resolve(source: &str, config: &RoutingConfig) -> Vec<Destination> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for rule in config.rules.iter().filter(|rule| rule.source_match.matches(source)) {
        let Some(destination) = config.destination(&rule.destination) else {
            tracing::debug!(
                source,
                destination = %rule.destination,
                "rule targets unknown destination, skipped"
            );
            continue;
        };
        if !is_routable(destination) {
            tracing::debug!(
                source,
                destination = %destination.name,
                "destination url is not absolute, skipped"
            );
            continue;
        }

        if seen.insert(destination.name.as_str()) {
            resolved.push(destination.clone());
        }
    }

    resolved
}

/// Whether a destination can receive deliveries at all.
pub fn is_routable(destination: &Destination) -> bool {
    url::Url::parse(&destination.url).is_ok()
}

/// Lists every configuration problem in a routing snapshot.
pub fn validate(config: &RoutingConfig) -> Vec<RoutingIssue> {
    let mut issues = Vec::new();
    let mut names = HashSet::new();

    for destination in &config.destinations {
        if !names.insert(destination.name.as_str()) {
            issues.push(RoutingIssue::DuplicateDestination { name: destination.name.clone() });
        }
        if !is_routable(destination) {
            issues.push(RoutingIssue::InvalidUrl {
                name: destination.name.clone(),
                url: destination.url.clone(),
            });
        }
        if let Some(Err(err)) = destination.health_probe.as_ref().map(|p| p.validate()) {
            issues.push(RoutingIssue::InvalidProbe {
                name: destination.name.clone(),
                reason: err.to_string(),
            });
        }
    }

    for (rule_index, rule) in config.rules.iter().enumerate() {
        if !names.contains(rule.destination.as_str()) {
            issues.push(RoutingIssue::UnknownDestination {
                rule_index,
                destination: rule.destination.clone(),
            });
        }
    }

    issues
}

/// Logs every problem in a snapshot once.
///
/// Called whenever a routing snapshot is installed.
pub fn warn_issues(config: &RoutingConfig) -> usize {
    let issues = validate(config);
    for issue in &issues {
        tracing::warn!(%issue, "routing configuration problem, entry skipped");
    }
    issues.len()
}
