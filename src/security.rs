use ipnet::IpNet;
use std::{fmt, net::IpAddr};

use crate::config::Policies;
use crate::error::ProxyError;

/// Outcome of evaluating a peer against the configured rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// The rule that settled a [`Verdict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    DenyAll,
    AllowAll,
    AllowList,
    NotInAllowList,
    DenyList,
    Default,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DenyAll => "deny_all",
            Self::AllowAll => "allow_all",
            Self::AllowList => "allow_list",
            Self::NotInAllowList => "not_in_allow_list",
            Self::DenyList => "deny_list",
            Self::Default => "default_allow",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub rule: Rule,
}

impl Decision {
    const fn allow(rule: Rule) -> Self {
        Self {
            verdict: Verdict::Allow,
            rule,
        }
    }

    const fn deny(rule: Rule) -> Self {
        Self {
            verdict: Verdict::Deny,
            rule,
        }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.verdict == Verdict::Allow
    }
}

/// Compiled allow/deny rules. Evaluation is pure; the engine holds nothing
/// but the rule set.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    allow_all: bool,
    deny_all: bool,
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
}

impl PolicyEngine {
    /// Compiles the policy section of the configuration. Entries may be plain
    /// addresses, CIDR networks, or `"*"` (same as `allowAll`/`denyAll`).
    pub fn new(policies: &Policies) -> Result<Self, ProxyError> {
        let (allow_wildcard, allow) = parse_entries("allow", &policies.allow)?;
        let (deny_wildcard, deny) = parse_entries("deny", &policies.deny)?;

        Ok(Self {
            allow_all: policies.allow_all || allow_wildcard,
            deny_all: policies.deny_all || deny_wildcard,
            allow,
            deny,
        })
    }

    /// Decides whether `peer` may be relayed.
    ///
    /// `denyAll` beats everything, then `allowAll`. A non-empty allow list
    /// turns the policy into default-deny, and a deny-list hit overrides an
    /// allow-list hit.
    #[must_use]
    pub fn decide(&self, peer: IpAddr) -> Decision {
        if self.deny_all {
            return Decision::deny(Rule::DenyAll);
        }
        if self.allow_all {
            return Decision::allow(Rule::AllowAll);
        }

        let peer = canonical(peer);
        let mut candidate = Decision::allow(Rule::Default);

        if !self.allow.is_empty() {
            if !matches_any(&self.allow, peer) {
                return Decision::deny(Rule::NotInAllowList);
            }
            candidate = Decision::allow(Rule::AllowList);
        }

        if matches_any(&self.deny, peer) {
            return Decision::deny(Rule::DenyList);
        }

        candidate
    }
}

fn parse_entries(list: &'static str, entries: &[String]) -> Result<(bool, Vec<IpNet>), ProxyError> {
    let mut wildcard = false;
    let mut nets = Vec::with_capacity(entries.len());

    for entry in entries {
        let entry = entry.trim();
        if entry == "*" {
            wildcard = true;
        }
        // Try parsing as individual IP address first
        else if let Ok(ip) = entry.parse::<IpAddr>() {
            nets.push(IpNet::from(canonical(ip)));
        }
        // Try parsing as CIDR subnet
        else if let Ok(net) = entry.parse::<IpNet>() {
            nets.push(net);
        } else {
            return Err(ProxyError::InvalidPolicyEntry {
                list,
                entry: entry.to_string(),
            });
        }
    }

    Ok((wildcard, nets))
}

fn matches_any(nets: &[IpNet], ip: IpAddr) -> bool {
    nets.iter().any(|net| net.contains(&ip))
}

/// IPv4-mapped IPv6 peers (dual-stack listeners) compare as plain IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio_test::assert_err;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn engine(configure: impl FnOnce(&mut Policies)) -> PolicyEngine {
        let mut policies = Policies::default();
        configure(&mut policies);
        PolicyEngine::new(&policies).unwrap()
    }

    mod decisions {
        use super::*;

        #[test]
        fn allow_list_is_exclusive() {
            let engine = engine(|p| p.allow = vec![A.to_string()]);

            assert_eq!(engine.decide(A), Decision::allow(Rule::AllowList));
            assert_eq!(engine.decide(B), Decision::deny(Rule::NotInAllowList));
        }

        #[test]
        fn deny_list_overrides_allow_list() {
            let engine = engine(|p| {
                p.allow = vec![A.to_string()];
                p.deny = vec![A.to_string()];
            });

            assert_eq!(engine.decide(A), Decision::deny(Rule::DenyList));
        }

        #[test]
        fn deny_all_beats_allow_all() {
            let engine = engine(|p| {
                p.allow_all = true;
                p.deny_all = true;
            });

            assert_eq!(engine.decide(A), Decision::deny(Rule::DenyAll));
            assert_eq!(engine.decide(B), Decision::deny(Rule::DenyAll));
        }

        #[test]
        fn allow_all_skips_lists() {
            let engine = engine(|p| {
                p.allow_all = true;
                p.deny = vec![A.to_string()];
            });

            assert_eq!(engine.decide(A), Decision::allow(Rule::AllowAll));
        }

        #[test]
        fn empty_policy_allows_everyone() {
            let engine = engine(|_| {});

            assert_eq!(engine.decide(A), Decision::allow(Rule::Default));
            assert_eq!(
                engine.decide(IpAddr::V6(Ipv6Addr::LOCALHOST)),
                Decision::allow(Rule::Default)
            );
        }

        #[test]
        fn deny_list_alone_blocks_only_listed() {
            let engine = engine(|p| p.deny = vec![B.to_string()]);

            assert!(engine.decide(A).is_allowed());
            assert_eq!(engine.decide(B), Decision::deny(Rule::DenyList));
        }
    }

    mod entries {
        use super::*;

        #[test]
        fn wildcards_map_to_flags() {
            let allow = engine(|p| p.allow = vec!["*".to_string()]);
            let deny = engine(|p| {
                p.allow = vec!["*".to_string()];
                p.deny = vec!["*".to_string()];
            });

            assert_eq!(allow.decide(B), Decision::allow(Rule::AllowAll));
            assert_eq!(deny.decide(B), Decision::deny(Rule::DenyAll));
        }

        #[test]
        fn cidr_entries_match_networks() {
            let engine = engine(|p| {
                p.allow = vec!["10.0.0.0/8".to_string()];
                p.deny = vec!["10.0.0.2/32".to_string()];
            });

            assert!(engine.decide(A).is_allowed());
            assert!(!engine.decide(B).is_allowed());
            assert!(!engine.decide(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))).is_allowed());
        }

        #[test]
        fn mapped_ipv6_peers_match_ipv4_entries() {
            let engine = engine(|p| p.allow = vec![A.to_string()]);
            let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped());

            assert!(engine.decide(mapped).is_allowed());
        }

        #[test]
        fn rejects_invalid_entries() {
            let policies = Policies {
                deny: vec!["not-an-ip".to_string()],
                ..Policies::default()
            };

            let error = assert_err!(PolicyEngine::new(&policies));
            assert!(matches!(
                error,
                ProxyError::InvalidPolicyEntry { list: "deny", .. }
            ));
        }
    }
}
