//! Candidate pairs and their ordering

use std::fmt;

use tandem_core::{CandidateType, IceCandidate, IceRole};

/// A local/remote candidate combination to be checked
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandidatePair {
    pub local: IceCandidate,
    pub remote: IceCandidate,
    pub priority: u64,
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// RFC 8445 §6.1.2.3 pair priority.
///
/// `controlling` and `controlled` are the candidate priorities of the
/// controlling and controlled agent respectively.
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let (g, d) = (controlling as u64, controlled as u64);
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

/// Build the check list, highest priority first.
///
/// Server-reflexive local candidates are pruned: checks are sent from their
/// base, which is already paired as a host candidate. Pairs only form within
/// one address family and one component.
pub fn form_pairs(
    local: &[IceCandidate],
    remote: &[IceCandidate],
    role: IceRole,
) -> Vec<CandidatePair> {
    let mut pairs = Vec::new();

    for l in local.iter().filter(|c| c.kind != CandidateType::Srflx) {
        for r in remote {
            if l.component != r.component || l.address.is_ipv4() != r.address.is_ipv4() {
                continue;
            }
            let priority = match role {
                IceRole::Controlling => pair_priority(l.priority, r.priority),
                IceRole::Controlled => pair_priority(r.priority, l.priority),
            };
            let pair = CandidatePair {
                local: l.clone(),
                remote: r.clone(),
                priority,
            };
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
    }

    pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str, pref: u16) -> IceCandidate {
        IceCandidate::host(addr.parse().unwrap(), pref)
    }

    #[test]
    fn priority_is_symmetric_in_ordering() {
        assert!(pair_priority(10, 5) > pair_priority(5, 10));
        assert_eq!(pair_priority(7, 7), (1u64 << 32) * 7 + 14);
    }

    #[test]
    fn pairs_sorted_and_family_matched() {
        let local = vec![host("10.0.0.1:1000", 100), host("[::1]:1000", 200)];
        let remote = vec![host("10.0.0.2:2000", 50), host("10.0.0.3:2000", 60000)];
        let pairs = form_pairs(&local, &remote, IceRole::Controlling);
        assert_eq!(pairs.len(), 2);
        assert!(pairs[0].priority >= pairs[1].priority);
        assert_eq!(pairs[0].remote.address, "10.0.0.3:2000".parse().unwrap());
    }

    #[test]
    fn reflexive_locals_are_pruned() {
        let base = "10.0.0.1:1000".parse().unwrap();
        let local = vec![
            IceCandidate::host(base, 100),
            IceCandidate::server_reflexive("198.51.100.1:3000".parse().unwrap(), base, 100),
        ];
        let remote = vec![host("10.0.0.2:2000", 50)];
        let pairs = form_pairs(&local, &remote, IceRole::Controlled);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].local.kind, CandidateType::Host);
    }
}
