// SPDX-License-Identifier: MIT OR Apache-2.0

//! Causal graphs ("tangles") of messages linked by `previous` pointers.
//!
//! Messages of one tangle can arrive in any order, from any number of feeds. A node is only
//! "connected" when every id listed in its `previous` is already connected, until then it waits in
//! a pending buffer. Pending nodes are never guessed at and never dropped, they get reprocessed
//! as soon as their missing ancestors arrive.
//!
//! Connected nodes which are not referenced by any other connected node form the frontier of the
//! tangle, its "tips". New messages appended to the tangle point at these tips.
//!
//! The resulting state is a pure function of the set of nodes which have been added, independent
//! of their arrival order.
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::{Debug, Display};
use std::hash::Hash as StdHash;

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Dfs, Reversed};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

use crate::hash::Hash;

/// Identifier of a node in a tangle.
pub trait NodeId: Copy + Clone + Debug + Display + Eq + Ord + StdHash {}

impl NodeId for Hash {}

/// Message observed as part of a tangle, immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TangleNode<ID, P> {
    pub id: ID,
    pub previous: Vec<ID>,
    pub payload: P,
}

impl<ID, P> TangleNode<ID, P> {
    pub fn new(id: ID, previous: Vec<ID>, payload: P) -> Self {
        Self {
            id,
            previous,
            payload,
        }
    }

    /// Node without any `previous`, starting a new tangle.
    pub fn root(id: ID, payload: P) -> Self {
        Self::new(id, Vec::new(), payload)
    }

    pub fn is_root(&self) -> bool {
        self.previous.is_empty()
    }
}

/// Directed acyclic graph of tangle nodes with pending buffer and tip tracking.
#[derive(Clone, Debug)]
pub struct TangleGraph<ID, P>
where
    ID: NodeId,
{
    root: Option<ID>,

    /// Arena of all connected nodes.
    nodes: HashMap<ID, TangleNode<ID, P>>,

    /// Edges from every connected node to its connected children.
    graph: DiGraphMap<ID, ()>,

    /// Connected nodes which are not listed in the `previous` of any other connected node.
    tips: BTreeSet<ID>,

    /// Nodes with at least one unknown ancestor.
    pending: HashMap<ID, TangleNode<ID, P>>,

    /// Missing parent id -> pending nodes referencing it.
    waiting_on: HashMap<ID, HashSet<ID>>,
}

impl<ID, P> Default for TangleGraph<ID, P>
where
    ID: NodeId,
{
    fn default() -> Self {
        Self {
            root: None,
            nodes: HashMap::new(),
            graph: DiGraphMap::new(),
            tips: BTreeSet::new(),
            pending: HashMap::new(),
            waiting_on: HashMap::new(),
        }
    }
}

impl<ID, P> TangleGraph<ID, P>
where
    ID: NodeId,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = TangleNode<ID, P>>) -> Self {
        let mut tangle = Self::new();
        tangle.add_nodes(nodes);
        tangle
    }

    /// Add many nodes at once.
    ///
    /// Invalid nodes are logged and skipped. Returns the number of nodes which were not known
    /// before (connected or pending).
    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = TangleNode<ID, P>>) -> usize {
        let mut added = 0;
        for node in nodes {
            match self.add_node(node) {
                Ok(true) => added += 1,
                Ok(false) => (),
                Err(err) => warn!("rejected tangle node: {err}"),
            }
        }
        added
    }

    /// Add a single node, returns `false` if it was already known.
    ///
    /// Nodes referencing unknown ids are held back until these arrive.
    pub fn add_node(&mut self, node: TangleNode<ID, P>) -> Result<bool, TangleError<ID>> {
        if self.nodes.contains_key(&node.id) || self.pending.contains_key(&node.id) {
            return Ok(false);
        }

        if node.previous.contains(&node.id) {
            return Err(TangleError::SelfReference(node.id));
        }

        if node.is_root() {
            if let Some(root) = self.root {
                return Err(TangleError::SecondRoot {
                    node: node.id,
                    root,
                });
            }
        }

        let missing: Vec<ID> = node
            .previous
            .iter()
            .filter(|id| !self.nodes.contains_key(id))
            .copied()
            .collect();

        if missing.is_empty() {
            self.connect(node);
        } else {
            trace!(
                id = %node.id,
                missing = missing.len(),
                "buffer tangle node until previous arrive"
            );
            for parent in missing {
                self.waiting_on.entry(parent).or_default().insert(node.id);
            }
            self.pending.insert(node.id, node);
        }

        Ok(true)
    }

    fn connect(&mut self, node: TangleNode<ID, P>) {
        let mut queue = VecDeque::from([node]);

        while let Some(node) = queue.pop_front() {
            let id = node.id;

            self.graph.add_node(id);
            for parent in &node.previous {
                self.graph.add_edge(*parent, id, ());
                self.tips.remove(parent);
            }
            self.tips.insert(id);

            if node.is_root() {
                self.root = Some(id);
            }
            self.nodes.insert(id, node);

            // Re-check every pending node which was waiting for this one, it might be connected
            // now as well.
            let Some(waiting) = self.waiting_on.remove(&id) else {
                continue;
            };

            for waiting_id in waiting {
                let ready = self.pending.get(&waiting_id).is_some_and(|pending| {
                    pending
                        .previous
                        .iter()
                        .all(|parent| self.nodes.contains_key(parent))
                });

                if ready {
                    if let Some(pending) = self.pending.remove(&waiting_id) {
                        queue.push_back(pending);
                    }
                }
            }
        }
    }

    /// Current frontier of the tangle.
    ///
    /// The set is ordered by id, which carries no meaning beyond being stable.
    pub fn tips(&self) -> &BTreeSet<ID> {
        &self.tips
    }

    pub fn root(&self) -> Option<ID> {
        self.root
    }

    pub fn get(&self, id: &ID) -> Option<&TangleNode<ID, P>> {
        self.nodes.get(id)
    }

    /// Returns `true` if the node is connected.
    pub fn contains(&self, id: &ID) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn is_pending(&self, id: &ID) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of connected nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ids which pending nodes refer to but which have not been observed yet.
    pub fn missing(&self) -> BTreeSet<ID> {
        self.waiting_on
            .keys()
            .filter(|id| !self.pending.contains_key(id))
            .copied()
            .collect()
    }

    /// All ancestors of a connected node, not including the node itself.
    ///
    /// Returns `None` if the node is not connected.
    pub fn history(&self, id: &ID) -> Option<BTreeSet<ID>> {
        if !self.nodes.contains_key(id) {
            return None;
        }

        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, *id);
        let mut ancestors = BTreeSet::new();
        while let Some(ancestor) = dfs.next(reversed) {
            if ancestor != *id {
                ancestors.insert(ancestor);
            }
        }

        Some(ancestors)
    }

    /// Returns `true` if `ancestor` is reachable by following `previous` pointers from
    /// `descendant`.
    pub fn is_ancestor(&self, ancestor: &ID, descendant: &ID) -> bool {
        if ancestor == descendant || !self.nodes.contains_key(ancestor) {
            return false;
        }

        let mut dfs = Dfs::new(&self.graph, *ancestor);
        while let Some(node) = dfs.next(&self.graph) {
            if node == *descendant {
                return true;
            }
        }
        false
    }

    /// All connected nodes in causal order.
    ///
    /// Parents always come before their children, concurrent nodes are ordered by id.
    pub fn nodes(&self) -> Vec<&TangleNode<ID, P>> {
        let mut in_degree: HashMap<ID, usize> = self
            .graph
            .nodes()
            .map(|id| {
                let parents = self.graph.neighbors_directed(id, Direction::Incoming).count();
                (id, parents)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<ID>> = in_degree
            .iter()
            .filter(|(_, parents)| **parents == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();

        let mut ordered = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(id)) = ready.pop() {
            if let Some(node) = self.nodes.get(&id) {
                ordered.push(node);
            }

            for child in self.graph.neighbors_directed(id, Direction::Outgoing) {
                if let Some(parents) = in_degree.get_mut(&child) {
                    *parents -= 1;
                    if *parents == 0 {
                        ready.push(Reverse(child));
                    }
                }
            }
        }

        ordered
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TangleError<ID> {
    #[error("node {0} lists itself as previous")]
    SelfReference(ID),

    #[error("node {node} has no previous but the tangle is already rooted at {root}")]
    SecondRoot { node: ID, root: ID },
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rand::SeedableRng;
    use rand::seq::SliceRandom;
    use rand_chacha::ChaCha20Rng;

    use super::{NodeId, TangleError, TangleGraph, TangleNode};

    impl NodeId for &'static str {}

    fn node(id: &'static str, previous: &[&'static str]) -> TangleNode<&'static str, ()> {
        TangleNode::new(id, previous.to_vec(), ())
    }

    fn tips(tangle: &TangleGraph<&'static str, ()>) -> Vec<&'static str> {
        tangle.tips().iter().copied().collect()
    }

    //   A <-- B1 <-- C1 <--\
    //     \-- B2 <-- C2 <-- D
    //          \---- C3 <--/
    fn diamond() -> Vec<TangleNode<&'static str, ()>> {
        vec![
            node("a", &[]),
            node("b1", &["a"]),
            node("b2", &["a"]),
            node("c1", &["b1"]),
            node("c2", &["b2"]),
            node("c3", &["b2"]),
            node("d", &["c1", "c2", "c3"]),
        ]
    }

    #[test]
    fn linear_chain_has_one_tip() {
        let tangle = TangleGraph::from_nodes([node("a", &[]), node("b", &["a"]), node("c", &["b"])]);
        assert_eq!(tangle.root(), Some("a"));
        assert_eq!(tips(&tangle), vec!["c"]);
        assert_eq!(tangle.len(), 3);
    }

    #[test]
    fn fork_and_merge() {
        let mut tangle = TangleGraph::from_nodes([node("a", &[]), node("b", &["a"]), node("c", &["a"])]);
        assert_eq!(tips(&tangle), vec!["b", "c"]);

        tangle.add_node(node("d", &["b", "c"])).unwrap();
        assert_eq!(tips(&tangle), vec!["d"]);
    }

    #[test]
    fn buffers_until_previous_arrive() {
        let mut tangle = TangleGraph::new();
        tangle.add_nodes([
            node("a", &[]),
            node("c", &["b"]),
            node("d", &["c"]),
            node("e", &["d"]),
        ]);
        assert_eq!(tangle.len(), 1);
        assert_eq!(tangle.pending_len(), 3);
        assert!(tangle.is_pending(&"e"));
        assert_eq!(tangle.missing(), BTreeSet::from(["b"]));
        assert_eq!(tips(&tangle), vec!["a"]);

        tangle.add_node(node("b", &["a"])).unwrap();
        assert_eq!(tangle.len(), 5);
        assert_eq!(tangle.pending_len(), 0);
        assert!(tangle.missing().is_empty());
        assert_eq!(tips(&tangle), vec!["e"]);
    }

    #[test]
    fn waits_for_every_previous() {
        let mut tangle = TangleGraph::from_nodes([node("a", &[]), node("b", &["a"])]);
        tangle.add_node(node("d", &["b", "c"])).unwrap();
        assert!(tangle.is_pending(&"d"));
        assert_eq!(tips(&tangle), vec!["b"]);

        tangle.add_node(node("c", &["a"])).unwrap();
        assert!(tangle.contains(&"d"));
        assert_eq!(tips(&tangle), vec!["d"]);
    }

    #[test]
    fn adding_is_idempotent() {
        let mut tangle = TangleGraph::from_nodes(diamond());
        let tips_before = tangle.tips().clone();
        let len_before = tangle.len();

        assert_eq!(tangle.add_nodes(diamond()), 0);
        assert_eq!(tangle.tips(), &tips_before);
        assert_eq!(tangle.len(), len_before);
        assert_eq!(tangle.pending_len(), 0);

        // Same for nodes which are still pending.
        let mut tangle = TangleGraph::from_nodes([node("c", &["b"])]);
        assert_eq!(tangle.add_nodes([node("c", &["b"])]), 0);
        assert_eq!(tangle.pending_len(), 1);
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let expected = TangleGraph::from_nodes(diamond());
        let expected_order: Vec<_> = expected.nodes().iter().map(|node| node.id).collect();

        let mut rng = ChaCha20Rng::from_seed([7; 32]);
        for _ in 0..50 {
            let mut nodes = diamond();
            nodes.shuffle(&mut rng);

            let tangle = TangleGraph::from_nodes(nodes);
            assert_eq!(tangle.tips(), expected.tips());
            assert_eq!(tangle.len(), 7);
            assert_eq!(tangle.pending_len(), 0);

            let order: Vec<_> = tangle.nodes().iter().map(|node| node.id).collect();
            assert_eq!(order, expected_order);
        }
    }

    #[test]
    fn causal_order_with_id_tie_break() {
        let tangle = TangleGraph::from_nodes(diamond());
        let order: Vec<_> = tangle.nodes().iter().map(|node| node.id).collect();
        assert_eq!(order, vec!["a", "b1", "b2", "c1", "c2", "c3", "d"]);
    }

    #[test]
    fn history_contains_all_ancestors() {
        let tangle = TangleGraph::from_nodes(diamond());
        assert_eq!(
            tangle.history(&"c3"),
            Some(BTreeSet::from(["a", "b2"]))
        );
        assert_eq!(
            tangle.history(&"d"),
            Some(BTreeSet::from(["a", "b1", "b2", "c1", "c2", "c3"]))
        );
        assert_eq!(tangle.history(&"a"), Some(BTreeSet::new()));
        assert_eq!(tangle.history(&"unknown"), None);

        assert!(tangle.is_ancestor(&"b2", &"d"));
        assert!(!tangle.is_ancestor(&"c1", &"c2"));
        assert!(!tangle.is_ancestor(&"d", &"a"));
    }

    #[test]
    fn duplicate_previous_entries() {
        let tangle = TangleGraph::from_nodes([node("a", &[]), node("b", &["a", "a", "a"])]);
        assert_eq!(tips(&tangle), vec!["b"]);
        assert_eq!(tangle.history(&"b"), Some(BTreeSet::from(["a"])));
    }

    #[test]
    fn invalid_nodes() {
        let mut tangle = TangleGraph::from_nodes([node("a", &[])]);
        assert_eq!(
            tangle.add_node(node("b", &["b"])),
            Err(TangleError::SelfReference("b"))
        );
        assert_eq!(
            tangle.add_node(node("z", &[])),
            Err(TangleError::SecondRoot {
                node: "z",
                root: "a"
            })
        );

        // Invalid nodes are skipped when adding in bulk.
        assert_eq!(tangle.add_nodes([node("z", &[]), node("b", &["a"])]), 1);
        assert_eq!(tips(&tangle), vec!["b"]);
    }
}
