//! The load-balancing decision: given what every other host owns and how
//! much self already owns, decide whether to steal a lease this iteration.
//!
//! Deliberately free of I/O and async so its invariants can be checked by
//! plain property tests.

use crate::model::Lease;
use std::collections::HashMap;

/// Given the leases currently owned by other hosts and the number owned by
/// self, return at most one lease to attempt to steal.
///
/// Steals from whichever host owns the most leases, and only when doing so
/// cannot make self the new busiest host. With `L` partitions and `H` hosts,
/// an even split puts every host within one lease of every other, so a gap
/// of 2 is the smallest threshold that guarantees a single steal can never
/// overshoot and make self the new busiest host, which is what prevents two
/// hosts from endlessly stealing the same lease back and forth.
pub fn steal(leases_owned_by_others: &[Lease], self_owned_count: usize) -> Option<Lease> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for lease in leases_owned_by_others {
        if let Some(owner) = lease.owner.as_deref() {
            *counts.entry(owner).or_insert(0) += 1;
        }
    }

    let (biggest_owner, biggest_count) = counts.into_iter().fold(
        (None::<&str>, 0usize),
        |(best_owner, best_count), (owner, count)| {
            if count > best_count {
                (Some(owner), count)
            } else {
                (best_owner, best_count)
            }
        },
    )?;

    if biggest_count.saturating_sub(self_owned_count) < 2 {
        return None;
    }

    leases_owned_by_others
        .iter()
        .find(|l| l.owner.as_deref() == Some(biggest_owner))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PartitionId;
    use proptest::prelude::*;
    use std::time::{Duration, Instant};

    fn owned_lease(partition: &str, owner: &str) -> Lease {
        Lease {
            partition_id: PartitionId::new(partition),
            owner: Some(owner.to_string()),
            expiry: Instant::now() + Duration::from_secs(30),
            epoch: "1".to_string(),
        }
    }

    #[test]
    fn no_steal_when_no_other_leases() {
        assert_eq!(steal(&[], 0), None);
    }

    #[test]
    fn no_steal_when_gap_is_one() {
        // 2 partitions total, self 1, other 1: perfectly even, nothing to do.
        let others = vec![owned_lease("p0", "host-b")];
        assert_eq!(steal(&others, 1), None);
    }

    #[test]
    fn steals_when_gap_is_two_or_more() {
        let others = vec![
            owned_lease("p0", "host-b"),
            owned_lease("p1", "host-b"),
            owned_lease("p2", "host-b"),
            owned_lease("p3", "host-b"),
        ];
        let stolen = steal(&others, 0).expect("should steal");
        assert_eq!(stolen.owner.as_deref(), Some("host-b"));
    }

    #[test]
    fn steals_from_the_biggest_owner_only() {
        let others = vec![
            owned_lease("p0", "host-b"),
            owned_lease("p1", "host-c"),
            owned_lease("p2", "host-c"),
            owned_lease("p3", "host-c"),
        ];
        let stolen = steal(&others, 0).expect("should steal");
        assert_eq!(stolen.owner.as_deref(), Some("host-c"));
    }

    #[test]
    fn uneven_split_halts_at_gap_one() {
        // 5 partitions, 2 hosts: 3/2 is the converged state, not 2/3 or further.
        let others = vec![
            owned_lease("p0", "host-a"),
            owned_lease("p1", "host-a"),
            owned_lease("p2", "host-a"),
        ];
        assert_eq!(steal(&others, 2), None);
    }

    fn arb_leases(max_owners: usize, max_per_owner: usize) -> impl Strategy<Value = Vec<Lease>> {
        proptest::collection::vec(0..max_owners, 0..(max_owners * max_per_owner)).prop_map(|owners| {
            owners
                .into_iter()
                .enumerate()
                .map(|(i, owner_idx)| owned_lease(&format!("p{i}"), &format!("host-{owner_idx}")))
                .collect()
        })
    }

    proptest! {
        /// After a steal (if any), self never ends up owning more than the
        /// victim does post-steal.
        #[test]
        fn balancer_stability(leases in arb_leases(6, 20), self_count in 0usize..40) {
            if let Some(stolen) = steal(&leases, self_count) {
                let victim = stolen.owner.clone().unwrap();
                let victim_count_before = leases.iter().filter(|l| l.owner.as_deref() == Some(victim.as_str())).count();
                let post_self = self_count + 1;
                let post_victim = victim_count_before - 1;
                prop_assert!(post_self <= post_victim);
            }
        }

        /// A steal happens iff the gap is >= 2.
        #[test]
        fn balancer_conservatism(leases in arb_leases(6, 20), self_count in 0usize..40) {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for l in &leases {
                if let Some(owner) = &l.owner {
                    *counts.entry(owner.clone()).or_insert(0) += 1;
                }
            }
            let max_others = counts.values().copied().max().unwrap_or(0);
            let should_steal = max_others.saturating_sub(self_count) >= 2;
            prop_assert_eq!(steal(&leases, self_count).is_some(), should_steal);
        }

        /// The balancer never returns more than one lease, trivially true
        /// given the return type, but we assert no panics across a wide span
        /// of input sizes as the actual regression guard.
        #[test]
        fn one_steal_per_iteration(leases in arb_leases(10, 50), self_count in 0usize..100) {
            let _ = steal(&leases, self_count);
        }
    }
}
