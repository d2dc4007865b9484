// Copyright © 2024 Pathway

//! Binary merge tree.
//!
//! Every strand is a leaf. Leaves are paired left to right, each pair shares
//! a parent (its sink), and the pairing repeats on the parents until a single
//! root remains. A node left without a partner in a layer is carried over to
//! the next one, so the height is the ceiling of log2 of the leaf count.
//!
//! A pair is ready once both nodes hold a value; the lesser of the two moves
//! into the sink. The weaving thread takes records from the root. Nodes live
//! in an arena and refer to each other by handle, so rebuilding the tree for
//! a new run is just replacing the arena.

pub mod strategy;

use std::collections::VecDeque;
use std::fmt;

use id_arena::{Arena, ArenaBehavior};
use log::{debug, warn};

use self::strategy::{Activity, NodeStrategy};
use super::{Progress, Weaver};
use crate::engine::Record;
use crate::strands::{Strand, StrandId};

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct NodeHandle {
    arena_id: u32,
    index: u32,
}

impl ArenaBehavior for NodeHandle {
    type Id = Self;

    fn new_id(arena_id: u32, index: usize) -> Self {
        let index = index.try_into().unwrap();
        Self { arena_id, index }
    }

    fn arena_id(handle: Self) -> u32 {
        handle.arena_id
    }

    fn index(handle: Self) -> usize {
        handle.index.try_into().unwrap()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeLinks {
    pub peer: Option<NodeHandle>,
    pub sink: Option<NodeHandle>,
    pub sources: Option<(NodeHandle, NodeHandle)>,
}

pub trait TreeNode {
    fn links(&self) -> &NodeLinks;
    fn links_mut(&mut self) -> &mut NodeLinks;
}

impl TreeNode for NodeLinks {
    fn links(&self) -> &NodeLinks {
        self
    }

    fn links_mut(&mut self) -> &mut NodeLinks {
        self
    }
}

/// The shape of a merge tree. Leaves are allocated first, parents always
/// after their sources.
pub struct TreeLayout<T = NodeLinks> {
    pub nodes: Arena<T, NodeHandle>,
    pub leaves: Vec<NodeHandle>,
    pub root: Option<NodeHandle>,
}

impl<T: TreeNode> TreeLayout<T> {
    pub fn empty() -> Self {
        Self {
            nodes: Arena::new(),
            leaves: Vec::new(),
            root: None,
        }
    }

    /// Number of merge points between a node and the root.
    pub fn depth(&self, mut node: NodeHandle) -> usize {
        let mut depth = 0;
        while let Some(sink) = self.nodes[node].links().sink {
            depth += 1;
            node = sink;
        }
        depth
    }

    pub fn height(&self) -> usize {
        self.leaves
            .iter()
            .map(|&leaf| self.depth(leaf))
            .max()
            .unwrap_or(0)
    }

    pub fn internal_nodes(&self) -> usize {
        self.nodes.len() - self.leaves.len()
    }
}

pub fn make_tree(leaves: usize) -> TreeLayout {
    grow_tree((0..leaves).map(|_| NodeLinks::default()), NodeLinks::default)
}

/// Pairs up `leaves` into a tree, asking `parent` for every merge point.
pub fn grow_tree<T: TreeNode>(
    leaves: impl IntoIterator<Item = T>,
    mut parent: impl FnMut() -> T,
) -> TreeLayout<T> {
    let mut nodes: Arena<T, NodeHandle> = Arena::new();
    let leaves: Vec<NodeHandle> = leaves.into_iter().map(|leaf| nodes.alloc(leaf)).collect();

    let mut layer = leaves.clone();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2 + 1);
        for pair in layer.chunks(2) {
            match *pair {
                [left, right] => {
                    let mut node = parent();
                    node.links_mut().sources = Some((left, right));
                    let sink = nodes.alloc(node);
                    for (source, peer) in [(left, right), (right, left)] {
                        let links = nodes[source].links_mut();
                        links.peer = Some(peer);
                        links.sink = Some(sink);
                    }
                    next.push(sink);
                }
                // carried over and paired with the result of the next layer
                [odd] => next.push(odd),
                _ => unreachable!("chunks of two"),
            }
        }
        layer = next;
    }

    TreeLayout {
        root: layer.first().copied(),
        nodes,
        leaves,
    }
}

#[derive(Debug)]
struct Item<R> {
    record: R,
    origin: usize,
}

struct Leaf<R> {
    position: usize,
    strand: Strand<R>,
}

struct Node<R> {
    queue: VecDeque<Item<R>>,
    links: NodeLinks,
    leaf: Option<Leaf<R>>,
    exhausted: bool,
    activity: Activity,
}

impl<R> Node<R> {
    fn new(leaf: Option<Leaf<R>>, capacity: usize, activity: Activity) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            links: NodeLinks::default(),
            leaf,
            exhausted: false,
            activity,
        }
    }

    fn is_passive(&self) -> bool {
        self.exhausted || self.activity.inactive
    }

    fn strand(&self) -> Option<&Strand<R>> {
        self.leaf.as_ref().map(|leaf| &leaf.strand)
    }
}

impl<R> TreeNode for Node<R> {
    fn links(&self) -> &NodeLinks {
        &self.links
    }

    fn links_mut(&mut self) -> &mut NodeLinks {
        &mut self.links
    }
}

pub struct MergeTree<R> {
    tree: TreeLayout<Node<R>>,
    capacity: usize,
    strategy: Box<dyn NodeStrategy>,
    last_emitted: Option<R>,
    dropped_late: u64,
}

impl<R: Record> MergeTree<R> {
    pub fn new(strategy: Box<dyn NodeStrategy>, capacity: usize) -> Self {
        Self {
            tree: TreeLayout::empty(),
            capacity: capacity.max(1),
            strategy,
            last_emitted: None,
            dropped_late: 0,
        }
    }

    /// Records dropped because an idle leaf woke up behind the merge.
    pub fn dropped_late(&self) -> u64 {
        self.dropped_late
    }

    pub fn buffered(&self) -> usize {
        self.tree
            .nodes
            .iter()
            .map(|(_, node)| node.queue.len())
            .sum()
    }

    fn build(&mut self, strands: &[Strand<R>]) {
        let capacity = self.capacity;
        let strategy = &self.strategy;
        let leaves = strands.iter().cloned().enumerate().map(|(position, strand)| {
            Node::new(
                Some(Leaf { position, strand }),
                capacity,
                strategy.build_node(),
            )
        });
        self.tree = grow_tree(leaves, || Node::new(None, capacity, strategy.build_node()));
    }

    fn refill(&mut self, handle: NodeHandle) {
        let capacity = self.capacity;
        let Node {
            queue,
            leaf,
            activity,
            ..
        } = &mut self.tree.nodes[handle];
        let Some(Leaf { position, strand }) = leaf else {
            return;
        };
        let mut woke_up = false;
        while queue.len() < capacity {
            let Some(record) = strand.pull_one() else {
                break;
            };
            queue.push_back(Item {
                record,
                origin: *position,
            });
            woke_up |= activity.record_activity();
        }
        if woke_up {
            debug!("{} is active again", strand.id());
            self.reactivate_ancestors(handle);
        }
    }

    fn reactivate_ancestors(&mut self, mut node: NodeHandle) {
        while let Some(sink) = self.tree.nodes[node].links.sink {
            let activity = &mut self.tree.nodes[sink].activity;
            if !activity.inactive {
                break;
            }
            activity.inactive = false;
            node = sink;
        }
    }

    fn update_exhausted(&mut self, handle: NodeHandle, dirty: &mut Vec<NodeHandle>) {
        let node = &self.tree.nodes[handle];
        if node.exhausted || !node.queue.is_empty() {
            return;
        }
        let exhausted = match (node.strand(), node.links.sources) {
            (Some(strand), _) => strand.is_exhausted(),
            (None, Some((left, right))) => {
                self.tree.nodes[left].exhausted && self.tree.nodes[right].exhausted
            }
            (None, None) => false,
        };
        if exhausted {
            let links = node.links;
            self.tree.nodes[handle].exhausted = true;
            dirty.extend(links.sink);
            dirty.extend(links.peer);
        }
    }

    /// Which of the two nodes gives its head to the sink, if any.
    fn pick(&self, left: NodeHandle, right: NodeHandle) -> Option<NodeHandle> {
        let (left_node, right_node) = (&self.tree.nodes[left], &self.tree.nodes[right]);
        match (left_node.queue.front(), right_node.queue.front()) {
            (Some(l), Some(r)) => Some(if r.record < l.record { right } else { left }),
            (Some(_), None) if right_node.is_passive() => Some(left),
            (None, Some(_)) if left_node.is_passive() => Some(right),
            _ => None,
        }
    }

    fn promote(&mut self, handle: NodeHandle) -> bool {
        let Some(sink) = self.tree.nodes[handle].links.sink else {
            return false;
        };
        // Ties go to the left source, which covers the lower strands.
        let Some((left, right)) = self.tree.nodes[sink].links.sources else {
            return false;
        };

        let mut moved = false;
        while self.tree.nodes[sink].queue.len() < self.capacity {
            let Some(from) = self.pick(left, right) else {
                break;
            };
            let Some(item) = self.tree.nodes[from].queue.pop_front() else {
                break;
            };
            self.tree.nodes[sink].queue.push_back(item);
            moved = true;
        }
        moved
    }

    fn drain_root(&mut self, root: NodeHandle, limit: Option<&R>, rope: &mut Vec<R>) -> bool {
        let tolerates_idle = self.strategy.idle_tolerance().is_some();
        let mut removed = false;
        loop {
            let queue = &mut self.tree.nodes[root].queue;
            if queue
                .front()
                .is_none_or(|item| limit.is_some_and(|limit| item.record > *limit))
            {
                break;
            }
            let Some(item) = queue.pop_front() else {
                break;
            };
            removed = true;
            if tolerates_idle
                && self
                    .last_emitted
                    .as_ref()
                    .is_some_and(|last| item.record < *last)
            {
                warn!(
                    "dropping record {:?} from leaf {}: it arrived after the merge moved past it to {:?}",
                    item.record, item.origin, self.last_emitted
                );
                self.dropped_late += 1;
                continue;
            }
            self.last_emitted = Some(item.record.clone());
            rope.push(item.record);
        }
        removed
    }

    /// The node has room again: it and whatever feeds it need another look.
    fn mark_drained(&self, handle: NodeHandle, dirty: &mut Vec<NodeHandle>) {
        dirty.push(handle);
        if let Some((left, right)) = self.tree.nodes[handle].links.sources {
            dirty.extend([left, right]);
        }
    }

    fn update_inactivity(&mut self) {
        let merge_points: Vec<(NodeHandle, (NodeHandle, NodeHandle))> = self
            .tree
            .nodes
            .iter()
            .filter_map(|(handle, node)| Some((handle, node.links.sources?)))
            .collect();
        for (handle, (left, right)) in merge_points {
            let (left, right) = (&self.tree.nodes[left], &self.tree.nodes[right]);
            let inactive = (left.activity.inactive || right.activity.inactive)
                && left.is_passive()
                && right.is_passive();
            let node = &mut self.tree.nodes[handle];
            node.activity.inactive = inactive && node.queue.is_empty();
        }
    }
}

impl<R: Record> Weaver<R> for MergeTree<R> {
    fn name(&self) -> &'static str {
        self.strategy.name()
    }

    fn begin(&mut self, strands: &[Strand<R>]) {
        self.build(strands);
        self.last_emitted = None;
        debug!(
            "built a merge tree with {} leaves and {} nodes",
            self.tree.leaves.len(),
            self.tree.nodes.len()
        );
    }

    fn weave(&mut self, _strands: &[Strand<R>], limit: Option<&R>, rope: &mut Vec<R>) -> Progress {
        let Some(root) = self.tree.root else {
            return Progress::Idle;
        };
        let before = rope.len();

        // Popped from the back, so leaves come first and parents after their sources.
        let mut dirty: Vec<NodeHandle> = self.tree.nodes.iter().map(|(handle, _)| handle).collect();
        dirty.reverse();
        while let Some(handle) = dirty.pop() {
            if self.tree.nodes[handle].leaf.is_some() {
                self.refill(handle);
            }
            self.update_exhausted(handle, &mut dirty);

            if handle == root {
                if self.drain_root(root, limit, rope) {
                    self.mark_drained(root, &mut dirty);
                }
                continue;
            }

            if self.promote(handle) {
                let links = self.tree.nodes[handle].links;
                dirty.extend(links.sink);
                self.mark_drained(handle, &mut dirty);
                if let Some(peer) = links.peer {
                    self.mark_drained(peer, &mut dirty);
                }
            }
        }
        self.update_exhausted(root, &mut dirty);

        let woven = rope.len() - before;
        if woven > 0 {
            Progress::Woven(woven)
        } else if self.tree.nodes[root].exhausted {
            Progress::Exhausted
        } else {
            Progress::Idle
        }
    }

    fn on_tick(&mut self) {
        for &leaf in &self.tree.leaves {
            let node = &mut self.tree.nodes[leaf];
            let was_inactive = node.activity.inactive;
            let holds_data = !node.queue.is_empty();
            self.strategy.on_tick(&mut node.activity, holds_data);
            if node.activity.inactive && !was_inactive {
                if let Some(strand) = node.strand() {
                    debug!(
                        "{} has been idle for {} intervals, no longer waiting for it",
                        strand.id(),
                        node.activity.idle_ticks
                    );
                }
            }
        }
        self.update_inactivity();
    }

    fn idle_tolerance(&self) -> Option<u32> {
        self.strategy.idle_tolerance()
    }

    fn retains_beyond(&self, _strands: &[Strand<R>], cutoff: &R) -> bool {
        let mut earliest: Vec<Option<&R>> = vec![None; self.tree.leaves.len()];
        for item in self
            .tree
            .nodes
            .iter()
            .flat_map(|(_, node)| node.queue.iter())
        {
            let slot = &mut earliest[item.origin];
            if slot.is_none_or(|current| item.record < *current) {
                *slot = Some(&item.record);
            }
        }
        self.tree
            .leaves
            .iter()
            .zip(&earliest)
            .all(|(&leaf, buffered)| {
                let Some(strand) = self.tree.nodes[leaf].strand() else {
                    return true;
                };
                match buffered.cloned().or_else(|| strand.head()) {
                    Some(record) => record > *cutoff,
                    None => strand.is_exhausted(),
                }
            })
    }

    fn end(&mut self) {
        let mut returned: Vec<Vec<R>> = self.tree.leaves.iter().map(|_| Vec::new()).collect();
        for (_, node) in self.tree.nodes.iter_mut() {
            for item in node.queue.drain(..) {
                returned[item.origin].push(item.record);
            }
        }
        for (&leaf, mut records) in self.tree.leaves.iter().zip(returned) {
            if let Some(strand) = self.tree.nodes[leaf].strand() {
                records.sort();
                strand.restore_front(records);
            }
        }
        self.tree = TreeLayout::empty();
    }

    fn stalled_strand(&self, _strands: &[Strand<R>]) -> Option<StrandId> {
        self.tree
            .leaves
            .iter()
            .map(|&leaf| &self.tree.nodes[leaf])
            .filter(|node| node.queue.is_empty() && !node.is_passive())
            .filter_map(Node::strand)
            .find(|strand| strand.is_empty())
            .map(Strand::id)
    }
}

impl<R: Record> fmt::Debug for MergeTree<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeTree")
            .field("strategy", &self.strategy.name())
            .field("leaves", &self.tree.leaves.len())
            .field("nodes", &self.tree.nodes.len())
            .field("buffered", &self.buffered())
            .field("dropped_late", &self.dropped_late)
            .finish()
    }
}
