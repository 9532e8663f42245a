//! Deterministic partition assignment.
//!
//! Consumers never negotiate an assignment. Each one reads the live member
//! set and the partition count and computes the whole group's assignment
//! locally with [`assign`]; because the function is pure and independent of
//! input order, every member that observes the same inputs arrives at the
//! same answer.

use std::collections::{BTreeMap, BTreeSet};

/// Consumer name -> partitions it should read.
pub type Assignment = BTreeMap<String, BTreeSet<u32>>;

/// Deal partitions `0..partition_count` round-robin over the sorted,
/// deduplicated consumer names.
///
/// Every partition goes to exactly one consumer. Consumers beyond the
/// partition count get an empty set. No consumers means no assignment.
pub fn assign<I, S>(consumers: I, partition_count: u32) -> Assignment
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let members: Vec<String> = consumers
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut assignment: Assignment = members
        .iter()
        .map(|name| (name.clone(), BTreeSet::new()))
        .collect();
    if members.is_empty() {
        return assignment;
    }

    for partition in 0..partition_count {
        let owner = &members[partition as usize % members.len()];
        if let Some(owned) = assignment.get_mut(owner) {
            owned.insert(partition);
        }
    }
    assignment
}

/// Partitions `consumer` should read under [`assign`].
pub fn partitions_for<I, S>(consumers: I, partition_count: u32, consumer: &str) -> BTreeSet<u32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    assign(consumers, partition_count)
        .remove(consumer)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(partitions: &[u32]) -> BTreeSet<u32> {
        partitions.iter().copied().collect()
    }

    #[test]
    fn test_round_robin_over_sorted_names() {
        let assignment = assign(["c2", "c1"], 5);
        assert_eq!(assignment["c1"], set(&[0, 2, 4]));
        assert_eq!(assignment["c2"], set(&[1, 3]));
    }

    #[test]
    fn test_order_independent() {
        assert_eq!(assign(["b", "a", "c"], 8), assign(["c", "b", "a"], 8));
    }

    #[test]
    fn test_duplicates_ignored() {
        assert_eq!(assign(["a", "a", "b"], 4), assign(["a", "b"], 4));
    }

    #[test]
    fn test_more_consumers_than_partitions() {
        let assignment = assign(["a", "b", "c"], 2);
        assert_eq!(assignment["a"], set(&[0]));
        assert_eq!(assignment["b"], set(&[1]));
        assert!(assignment["c"].is_empty());
    }

    #[test]
    fn test_empty_inputs() {
        assert!(assign(Vec::<String>::new(), 4).is_empty());
        let assignment = assign(["a"], 0);
        assert!(assignment["a"].is_empty());
    }

    #[test]
    fn test_partitions_for() {
        assert_eq!(partitions_for(["a", "b"], 4, "b"), set(&[1, 3]));
        assert!(partitions_for(["a", "b"], 4, "zed").is_empty());
    }
}
