use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::message::Endpoint;

/// Directed edges between endpoints. Each direction of a bidirectional
/// bridge is its own edge.
#[derive(Debug, Default)]
pub struct LinkGraph {
    /// source -> targets
    edges: RwLock<HashMap<Endpoint, BTreeSet<Endpoint>>>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an edge. Returns false if it already existed.
    pub fn add_link(&self, from: &Endpoint, to: &Endpoint) -> bool {
        self.edges
            .write()
            .entry(from.clone())
            .or_default()
            .insert(to.clone())
    }

    /// Remove an edge. Returns false if there was nothing to remove.
    pub fn remove_link(&self, from: &Endpoint, to: &Endpoint) -> bool {
        let mut edges = self.edges.write();
        let Some(targets) = edges.get_mut(from) else {
            return false;
        };
        let removed = targets.remove(to);
        if targets.is_empty() {
            edges.remove(from);
        }
        removed
    }

    /// Insert many edges under a single write lock, so readers never see a
    /// half-loaded graph.
    pub fn extend<I>(&self, links: I) -> usize
    where
        I: IntoIterator<Item = (Endpoint, Endpoint)>,
    {
        let mut edges = self.edges.write();
        links
            .into_iter()
            .filter(|(from, to)| edges.entry(from.clone()).or_default().insert(to.clone()))
            .count()
    }

    /// Every endpoint reachable from `source` over one or more edges.
    /// `source` itself is never part of the result, even when a cycle leads
    /// back to it.
    pub fn reachable_from(&self, source: &Endpoint) -> BTreeSet<Endpoint> {
        let edges = self.edges.read();
        let mut visited: HashSet<&Endpoint> = HashSet::new();
        visited.insert(source);
        let mut frontier: VecDeque<&Endpoint> = VecDeque::new();
        frontier.push_back(source);

        let mut reachable = BTreeSet::new();
        while let Some(current) = frontier.pop_front() {
            let Some(targets) = edges.get(current) else {
                continue;
            };
            for target in targets {
                if visited.insert(target) {
                    reachable.insert(target.clone());
                    frontier.push_back(target);
                }
            }
        }
        reachable
    }

    /// Every endpoint some other endpoint can deliver to. An endpoint with no
    /// incoming edge (self-loops aside) is unreachable from anywhere.
    pub fn delivery_targets(&self) -> HashSet<Endpoint> {
        let edges = self.edges.read();
        edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().filter(move |to| *to != from))
            .cloned()
            .collect()
    }

    /// Snapshot of every edge, ordered by source then target
    pub fn links(&self) -> Vec<(Endpoint, Endpoint)> {
        let edges = self.edges.read();
        let mut out: Vec<_> = edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (from.clone(), to.clone())))
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.edges.read().values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(channel: i64) -> Endpoint {
        Endpoint::new("discord", channel)
    }

    fn set(channels: &[i64]) -> BTreeSet<Endpoint> {
        channels.iter().map(|c| ep(*c)).collect()
    }

    #[test]
    fn test_add_is_idempotent() {
        let graph = LinkGraph::new();
        assert!(graph.add_link(&ep(1), &ep(2)));
        assert!(!graph.add_link(&ep(1), &ep(2)));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_remove_missing_edge_is_noop() {
        let graph = LinkGraph::new();
        assert!(!graph.remove_link(&ep(1), &ep(2)));
        graph.add_link(&ep(1), &ep(2));
        assert!(!graph.remove_link(&ep(2), &ep(1)));
        assert!(graph.remove_link(&ep(1), &ep(2)));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_chain() {
        let graph = LinkGraph::new();
        graph.add_link(&ep(1), &ep(2));
        graph.add_link(&ep(2), &ep(3));
        assert_eq!(graph.reachable_from(&ep(1)), set(&[2, 3]));
        assert_eq!(graph.reachable_from(&ep(2)), set(&[3]));
        assert!(graph.reachable_from(&ep(3)).is_empty());
    }

    #[test]
    fn test_bidirectional_cycle_terminates() {
        let graph = LinkGraph::new();
        graph.add_link(&ep(1), &ep(2));
        graph.add_link(&ep(2), &ep(1));
        assert_eq!(graph.reachable_from(&ep(1)), set(&[2]));
        assert_eq!(graph.reachable_from(&ep(2)), set(&[1]));
    }

    #[test]
    fn test_long_cycle_excludes_source() {
        let graph = LinkGraph::new();
        graph.add_link(&ep(1), &ep(2));
        graph.add_link(&ep(2), &ep(3));
        graph.add_link(&ep(3), &ep(4));
        graph.add_link(&ep(4), &ep(1));
        assert_eq!(graph.reachable_from(&ep(1)), set(&[2, 3, 4]));
        assert_eq!(graph.reachable_from(&ep(3)), set(&[1, 2, 4]));
    }

    #[test]
    fn test_self_loop_excluded() {
        let graph = LinkGraph::new();
        graph.add_link(&ep(1), &ep(1));
        assert!(graph.reachable_from(&ep(1)).is_empty());

        graph.add_link(&ep(1), &ep(2));
        assert_eq!(graph.reachable_from(&ep(1)), set(&[2]));
    }

    #[test]
    fn test_diamond_counts_join_once() {
        let graph = LinkGraph::new();
        graph.add_link(&ep(1), &ep(2));
        graph.add_link(&ep(1), &ep(3));
        graph.add_link(&ep(2), &ep(4));
        graph.add_link(&ep(3), &ep(4));
        assert_eq!(graph.reachable_from(&ep(1)), set(&[2, 3, 4]));
    }

    #[test]
    fn test_disconnected_components() {
        let graph = LinkGraph::new();
        graph.add_link(&ep(1), &ep(2));
        graph.add_link(&ep(10), &ep(11));
        assert_eq!(graph.reachable_from(&ep(1)), set(&[2]));
        assert_eq!(graph.reachable_from(&ep(10)), set(&[11]));
        assert!(graph.reachable_from(&ep(99)).is_empty());
    }

    #[test]
    fn test_mixed_platforms() {
        let graph = LinkGraph::new();
        let irc = Endpoint::new("irc", "#bridge");
        graph.add_link(&ep(1), &irc);
        graph.add_link(&irc, &Endpoint::new("telegram", -100));
        let reachable = graph.reachable_from(&ep(1));
        assert!(reachable.contains(&irc));
        assert!(reachable.contains(&Endpoint::new("telegram", -100)));
    }

    #[test]
    fn test_delivery_targets_ignore_self_loops() {
        let graph = LinkGraph::new();
        graph.add_link(&ep(1), &ep(2));
        graph.add_link(&ep(2), &ep(3));
        graph.add_link(&ep(4), &ep(4));
        let targets = graph.delivery_targets();
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&ep(2)));
        assert!(targets.contains(&ep(3)));
        assert!(!targets.contains(&ep(4)));
    }

    #[test]
    fn test_extend_skips_duplicates() {
        let graph = LinkGraph::new();
        let added = graph.extend(vec![(ep(1), ep(2)), (ep(1), ep(2)), (ep(2), ep(1))]);
        assert_eq!(added, 2);
        assert_eq!(graph.links(), vec![(ep(1), ep(2)), (ep(2), ep(1))]);
    }

    #[test]
    fn test_matches_transitive_closure() {
        // small exhaustive check against a naive fixpoint
        let edges = [(1, 2), (2, 3), (3, 1), (3, 4), (5, 5), (4, 6), (6, 4), (7, 1)];
        let graph = LinkGraph::new();
        for (a, b) in edges {
            graph.add_link(&ep(a), &ep(b));
        }
        for source in 1..=8 {
            let mut closure: BTreeSet<i64> = BTreeSet::new();
            loop {
                let before = closure.len();
                for (a, b) in edges {
                    if a == source || closure.contains(&a) {
                        closure.insert(b);
                    }
                }
                if closure.len() == before {
                    break;
                }
            }
            closure.remove(&source);
            let expected: Vec<i64> = closure.into_iter().collect();
            assert_eq!(graph.reachable_from(&ep(source)), set(&expected));
        }
    }
}
