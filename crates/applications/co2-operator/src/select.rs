//! Node selection policy
//!
//! Splits the scored nodes into the half that stays schedulable (allow) and
//! the half that gets drained (disallow), lowest emissions first.
//!
//! A fixed 50/50 split bounds how much capacity one cycle can remove. The
//! allow set is never empty for a non-empty cluster, so a single-node cluster
//! is never drained.

use serde::{Deserialize, Serialize};

/// A node and its emission value for the current cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScore {
    /// Node name
    pub node_name: String,
    /// MOER value
    pub moer: f64,
}

impl NodeScore {
    /// Create a score
    pub fn new(node_name: impl Into<String>, moer: f64) -> Self {
        Self {
            node_name: node_name.into(),
            moer,
        }
    }
}

/// Result of partitioning a cycle's nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Nodes to keep schedulable, ascending by emission
    pub allow: Vec<NodeScore>,
    /// Nodes to drain, ascending by emission
    pub disallow: Vec<NodeScore>,
}

impl Selection {
    /// Names of the allowed nodes
    pub fn allowed_names(&self) -> Vec<&str> {
        self.allow.iter().map(|s| s.node_name.as_str()).collect()
    }

    /// Names of the disallowed nodes
    pub fn disallowed_names(&self) -> Vec<&str> {
        self.disallow.iter().map(|s| s.node_name.as_str()).collect()
    }
}

/// Partition nodes by ascending emission value.
///
/// The sort is stable: equal values keep their input order.
pub fn select_nodes(mut scores: Vec<NodeScore>) -> Selection {
    scores.sort_by(|a, b| a.moer.total_cmp(&b.moer));

    let half = scores.len().div_ceil(2);
    let mut disallow = scores.split_off(half);
    let mut allow = scores;

    if allow.is_empty() && !disallow.is_empty() {
        allow.push(disallow.remove(0));
    }

    Selection { allow, disallow }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(values: &[(&str, f64)]) -> Vec<NodeScore> {
        values.iter().map(|(n, v)| NodeScore::new(*n, *v)).collect()
    }

    #[test]
    fn test_lowest_half_is_allowed() {
        let selection = select_nodes(scores(&[("A", 30.0), ("B", 70.0), ("C", 40.0), ("D", 60.0)]));

        assert_eq!(selection.allowed_names(), vec!["A", "C"]);
        assert_eq!(selection.disallowed_names(), vec!["D", "B"]);
    }

    #[test]
    fn test_odd_count_rounds_allow_up() {
        let selection = select_nodes(scores(&[("A", 50.0), ("B", 40.0), ("C", 60.0)]));

        assert_eq!(selection.allowed_names(), vec!["B", "A"]);
        assert_eq!(selection.disallowed_names(), vec!["C"]);
    }

    #[test]
    fn test_single_node_is_never_drained() {
        let selection = select_nodes(scores(&[("only", 75.0)]));

        assert_eq!(selection.allowed_names(), vec!["only"]);
        assert!(selection.disallow.is_empty());
    }

    #[test]
    fn test_empty_input() {
        let selection = select_nodes(Vec::new());
        assert_eq!(selection, Selection::default());
    }

    #[test]
    fn test_ties_keep_input_order() {
        let selection = select_nodes(scores(&[("A", 50.0), ("B", 50.0), ("C", 50.0), ("D", 50.0)]));

        assert_eq!(selection.allowed_names(), vec!["A", "B"]);
        assert_eq!(selection.disallowed_names(), vec!["C", "D"]);
    }

    #[test]
    fn test_partition_covers_every_node_once() {
        for n in 1..=9 {
            let input: Vec<NodeScore> = (0..n)
                .map(|i| NodeScore::new(format!("node-{i}"), ((i * 37) % 11) as f64))
                .collect();

            let selection = select_nodes(input.clone());

            let mut seen: Vec<&str> = selection
                .allowed_names()
                .into_iter()
                .chain(selection.disallowed_names())
                .collect();
            seen.sort_unstable();
            seen.dedup();

            assert_eq!(seen.len(), n, "n = {n}");
            assert_eq!(selection.allow.len(), n.div_ceil(2), "n = {n}");
            assert!(!selection.allow.is_empty());

            let max_allowed = selection.allow.iter().map(|s| s.moer).fold(f64::MIN, f64::max);
            let min_disallowed = selection.disallow.iter().map(|s| s.moer).fold(f64::MAX, f64::min);
            assert!(max_allowed <= min_disallowed, "n = {n}");
        }
    }
}
