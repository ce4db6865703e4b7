//! C8 — Policy engine.
//!
//! A pure function of `(peer_host, authenticated_flag)` — no I/O inside the decision
//! itself, grounded on the teacher's `policy/engine.rs` `evaluate_role`/
//! `check_membership` pure-decision style.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow(AllowReason),
    Deny(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowReason {
    PolicyDisabled,
    AllowedByAllowlist,
    AllowedByExempt,
    AllowedByFederation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    DeniedByDenylist,
    NotAllowed,
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow(_))
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            PolicyDecision::Allow(AllowReason::PolicyDisabled) => "policy_disabled",
            PolicyDecision::Allow(AllowReason::AllowedByAllowlist) => "allowed_by_allowlist",
            PolicyDecision::Allow(AllowReason::AllowedByExempt) => "allowed_by_exempt",
            PolicyDecision::Allow(AllowReason::AllowedByFederation) => "allowed_by_federation",
            PolicyDecision::Deny(DenyReason::DeniedByDenylist) => "denied_by_denylist",
            PolicyDecision::Deny(DenyReason::NotAllowed) => "not_allowed",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyState {
    pub global_enforce: bool,
    pub allow_list: HashSet<String>,
    pub deny_list: HashSet<String>,
    pub exempt_list: HashSet<String>,
}

fn norm(host: &str) -> String {
    host.to_lowercase()
}

impl PolicyState {
    /// Evaluates policy for `peer_host`. `is_member_of_federation` is supplied by the
    /// caller (C5's union membership), keeping this function free of I/O.
    pub fn evaluate(&self, peer_host: &str, is_member_of_federation: bool) -> PolicyDecision {
        if !self.global_enforce {
            return PolicyDecision::Allow(AllowReason::PolicyDisabled);
        }
        let host = norm(peer_host);
        if self.deny_list.iter().any(|h| norm(h) == host) {
            return PolicyDecision::Deny(DenyReason::DeniedByDenylist);
        }
        if self.allow_list.iter().any(|h| norm(h) == host) {
            return PolicyDecision::Allow(AllowReason::AllowedByAllowlist);
        }
        if self.exempt_list.iter().any(|h| norm(h) == host) {
            return PolicyDecision::Allow(AllowReason::AllowedByExempt);
        }
        if is_member_of_federation {
            return PolicyDecision::Allow(AllowReason::AllowedByFederation);
        }
        PolicyDecision::Deny(DenyReason::NotAllowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_policy_always_allows() {
        let p = PolicyState { global_enforce: false, ..Default::default() };
        assert_eq!(p.evaluate("evil.example", false), PolicyDecision::Allow(AllowReason::PolicyDisabled));
    }

    #[test]
    fn deny_wins_over_allow() {
        let p = PolicyState {
            global_enforce: true,
            allow_list: HashSet::from(["peer.example".to_string()]),
            deny_list: HashSet::from(["peer.example".to_string()]),
            ..Default::default()
        };
        assert_eq!(p.evaluate("peer.example", false), PolicyDecision::Deny(DenyReason::DeniedByDenylist));
    }

    #[test]
    fn exempt_bypasses_federation_check() {
        let p = PolicyState {
            global_enforce: true,
            exempt_list: HashSet::from(["peer.example".to_string()]),
            ..Default::default()
        };
        // is_member_of_federation=false, yet exempt still allows.
        assert_eq!(p.evaluate("peer.example", false), PolicyDecision::Allow(AllowReason::AllowedByExempt));
    }

    #[test]
    fn federation_union_allows_when_not_listed() {
        let p = PolicyState { global_enforce: true, ..Default::default() };
        assert_eq!(p.evaluate("peer.example", true), PolicyDecision::Allow(AllowReason::AllowedByFederation));
    }

    #[test]
    fn unknown_host_denied() {
        let p = PolicyState { global_enforce: true, ..Default::default() };
        assert_eq!(p.evaluate("peer.example", false), PolicyDecision::Deny(DenyReason::NotAllowed));
    }

    #[test]
    fn list_membership_is_case_insensitive() {
        let p = PolicyState {
            global_enforce: true,
            allow_list: HashSet::from(["Peer.Example".to_string()]),
            ..Default::default()
        };
        assert_eq!(p.evaluate("peer.example", false), PolicyDecision::Allow(AllowReason::AllowedByAllowlist));
    }
}
