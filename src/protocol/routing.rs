use std::collections::HashMap;

use rand::Rng;

use crate::core::NodeAddress;

/// Routing-tree position of one node
///
/// Tracks the parent link, the hop distance from the sink, the heights of
/// attached routing children, and parent offers collected during a route.
/// Depth is `None` ("unknown/infinite") while parentless; height is derived,
/// never stored.
#[derive(Debug, Default)]
pub struct RoutingTree {
    parent: Option<NodeAddress>,
    depth: Option<u16>,
    children: HashMap<NodeAddress, u16>,
    offers: Vec<(NodeAddress, u16)>,
}

impl RoutingTree {
    pub fn new() -> Self {
        RoutingTree::default()
    }

    /// Creates the sink's tree position: no parent, depth 0, permanently
    pub fn sink() -> Self {
        RoutingTree {
            depth: Some(0),
            ..RoutingTree::default()
        }
    }

    pub fn parent(&self) -> Option<NodeAddress> {
        self.parent
    }

    pub fn depth(&self) -> Option<u16> {
        self.depth
    }

    /// Attaches to `parent` that advertised `parent_depth`; own depth
    /// becomes one more
    pub fn set_parent(&mut self, parent: NodeAddress, parent_depth: u16) {
        self.parent = Some(parent);
        self.depth = Some(parent_depth.saturating_add(1));
    }

    /// Drops the parent link; depth reverts to unknown/infinite
    pub fn lose_parent(&mut self) {
        self.parent = None;
        self.depth = None;
    }

    /// Clears the whole position (start of a forced re-route)
    pub fn clear(&mut self) {
        self.parent = None;
        self.depth = None;
        self.children.clear();
        self.offers.clear();
    }

    /// Drops all routing children, keeping the parent link
    pub fn clear_children(&mut self) {
        self.children.clear();
    }

    /// Records a parent offer received during a bounded wait
    pub fn record_offer(&mut self, node: NodeAddress, depth: u16) {
        self.offers.push((node, depth));
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }

    /// Takes the smallest-depth offer, uniform-random tie-break, clearing
    /// the collected set
    pub fn take_best_offer(&mut self, rng: &mut impl Rng) -> Option<(NodeAddress, u16)> {
        let min_depth = self.offers.iter().map(|(_, d)| *d).min()?;
        let ties: Vec<(NodeAddress, u16)> = self
            .offers
            .iter()
            .copied()
            .filter(|(_, d)| *d == min_depth)
            .collect();
        self.offers.clear();
        Some(ties[rng.gen_range(0..ties.len())])
    }

    /// Registers a routing child; a new child starts at height 0
    pub fn add_child(&mut self, child: NodeAddress) {
        self.children.entry(child).or_insert(0);
    }

    /// Removes a routing child; returns true when it was present
    pub fn remove_child(&mut self, child: &NodeAddress) -> bool {
        self.children.remove(child).is_some()
    }

    pub fn has_child(&self, child: &NodeAddress) -> bool {
        self.children.contains_key(child)
    }

    pub fn children(&self) -> impl Iterator<Item = NodeAddress> + '_ {
        self.children.keys().copied()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Updates a child's reported height; returns true when it changed
    pub fn set_child_height(&mut self, child: NodeAddress, height: u16) -> bool {
        match self.children.insert(child, height) {
            Some(prev) => prev != height,
            None => true,
        }
    }

    /// Height: 0 for a leaf, else one more than the tallest child
    pub fn height(&self) -> u16 {
        self.children
            .values()
            .copied()
            .max()
            .map(|h| h.saturating_add(1))
            .unwrap_or(0)
    }
}
