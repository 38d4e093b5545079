//! Pure node-eligibility filtering, applied by the apply pipeline after
//! loading `forwarding_enabled` nodes and before handing them to the
//! synthesiser.

use serde::{Deserialize, Serialize};

/// Selects which forwarding-enabled nodes are actually eligible to be
/// synthesised into the runtime config, based on their last probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingPolicy {
    /// When false, every node passes (identity filter).
    pub healthy_only_enabled: bool,
    /// Ceiling a node's last latency must be at or under to pass, in
    /// milliseconds. Valid range is `[1, 10000]`.
    pub max_latency_ms: i64,
    /// Whether a never-probed node (empty status) still passes.
    pub allow_untested: bool,
}

/// Default latency ceiling used when no policy row exists yet.
pub const DEFAULT_MAX_LATENCY_MS: i64 = 1200;

impl Default for ForwardingPolicy {
    fn default() -> Self {
        Self {
            healthy_only_enabled: false,
            max_latency_ms: DEFAULT_MAX_LATENCY_MS,
            allow_untested: true,
        }
    }
}

/// The minimum probe-result fields the filter needs to see; decoupled
/// from the store's row type so this crate stays dependency-free.
#[derive(Debug, Clone)]
pub struct ProbeView {
    /// `"ok"`, `"error"`, or empty (never probed).
    pub last_test_status: String,
    /// Last measured latency, if any.
    pub last_latency_ms: Option<i64>,
}

/// Filters `nodes` against `policy`, returning the indices of the nodes
/// that pass. Operates on indices (rather than cloning/consuming a node
/// list of an unknown concrete type) so callers can apply it to whatever
/// their node representation is.
pub fn filter_eligible(nodes: &[ProbeView], policy: &ForwardingPolicy) -> Vec<usize> {
    if !policy.healthy_only_enabled {
        return (0..nodes.len()).collect();
    }
    nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| is_eligible(node, policy))
        .map(|(i, _)| i)
        .collect()
}

fn is_eligible(node: &ProbeView, policy: &ForwardingPolicy) -> bool {
    if node.last_test_status == "ok" {
        return node
            .last_latency_ms
            .is_some_and(|latency| latency <= policy.max_latency_ms);
    }
    node.last_test_status.is_empty() && policy.allow_untested
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(status: &str, latency: Option<i64>) -> ProbeView {
        ProbeView {
            last_test_status: status.to_string(),
            last_latency_ms: latency,
        }
    }

    #[test]
    fn identity_when_disabled() {
        let nodes = vec![probe("error", None), probe("ok", Some(9999))];
        let policy = ForwardingPolicy {
            healthy_only_enabled: false,
            ..Default::default()
        };
        assert_eq!(filter_eligible(&nodes, &policy), vec![0, 1]);
    }

    #[test]
    fn ok_under_ceiling_passes() {
        let nodes = vec![probe("ok", Some(100))];
        let policy = ForwardingPolicy {
            healthy_only_enabled: true,
            max_latency_ms: 200,
            allow_untested: false,
        };
        assert_eq!(filter_eligible(&nodes, &policy), vec![0]);
    }

    #[test]
    fn ok_over_ceiling_drops() {
        let nodes = vec![probe("ok", Some(300))];
        let policy = ForwardingPolicy {
            healthy_only_enabled: true,
            max_latency_ms: 200,
            allow_untested: false,
        };
        assert!(filter_eligible(&nodes, &policy).is_empty());
    }

    #[test]
    fn untested_passes_only_when_allowed() {
        let nodes = vec![probe("", None)];
        let policy_allow = ForwardingPolicy {
            healthy_only_enabled: true,
            allow_untested: true,
            ..Default::default()
        };
        let policy_deny = ForwardingPolicy {
            healthy_only_enabled: true,
            allow_untested: false,
            ..Default::default()
        };
        assert_eq!(filter_eligible(&nodes, &policy_allow), vec![0]);
        assert!(filter_eligible(&nodes, &policy_deny).is_empty());
    }

    #[test]
    fn error_status_always_drops() {
        let nodes = vec![probe("error", None)];
        let policy = ForwardingPolicy {
            healthy_only_enabled: true,
            allow_untested: true,
            ..Default::default()
        };
        assert!(filter_eligible(&nodes, &policy).is_empty());
    }
}
