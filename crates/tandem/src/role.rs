//! Deterministic polite/impolite role assignment
//!
//! Roles derive only from the presence set, so both peers reach the same
//! answer without exchanging anything. The lexicographically smallest peer id
//! is impolite: it creates the data channel, starts negotiation, and wins
//! offer collisions.

use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::types::{PeerId, Role};

/// Assign a role to every present peer
pub fn assign_roles<I, S>(peers: I) -> BTreeMap<PeerId, Role>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let sorted: BTreeSet<PeerId> = peers
        .into_iter()
        .map(|p| p.as_ref().to_string())
        .collect();

    if sorted.len() > 2 {
        warn!(
            "[Roles] {} peers present; protocol expects two, extra peers are polite",
            sorted.len()
        );
    }

    sorted
        .into_iter()
        .enumerate()
        .map(|(i, peer)| {
            let role = if i == 0 { Role::Impolite } else { Role::Polite };
            (peer, role)
        })
        .collect()
}

/// Role of the local peer, or `None` if it is not in the presence set
pub fn local_role<I, S>(local_peer_id: &str, peers: I) -> Option<Role>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    assign_roles(peers).get(local_peer_id).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_local_peer_is_impolite() {
        assert_eq!(local_role("peer-a", ["peer-a"]), Some(Role::Impolite));
    }

    #[test]
    fn test_smaller_id_is_impolite() {
        let roles = assign_roles(["peer-b", "peer-a"]);
        assert_eq!(roles["peer-a"], Role::Impolite);
        assert_eq!(roles["peer-b"], Role::Polite);
    }

    #[test]
    fn test_roles_are_deterministic() {
        let first = assign_roles(["zeta", "alpha"]);
        let second = assign_roles(["alpha", "zeta"]);
        assert_eq!(first, second);
        assert_eq!(assign_roles(["alpha", "zeta"]), second);
    }

    #[test]
    fn test_both_sides_agree() {
        let peers = ["x9", "x10"];
        let a = local_role("x9", peers).unwrap();
        let b = local_role("x10", peers).unwrap();
        assert_ne!(a, b);
        // Lexicographic, not numeric: "x10" < "x9"
        assert_eq!(b, Role::Impolite);
        assert!(a.is_polite());
    }

    #[test]
    fn test_third_peer_is_polite() {
        let roles = assign_roles(["c", "a", "b"]);
        assert_eq!(roles.len(), 3);
        assert_eq!(roles["a"], Role::Impolite);
        assert_eq!(roles["b"], Role::Polite);
        assert_eq!(roles["c"], Role::Polite);
    }

    #[test]
    fn test_absent_local_peer() {
        assert_eq!(local_role("ghost", ["a", "b"]), None);
        assert!(assign_roles(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_duplicates_collapse() {
        let roles = assign_roles(["a", "a", "b"]);
        assert_eq!(roles.len(), 2);
    }
}
