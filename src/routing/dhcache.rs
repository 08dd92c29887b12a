// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The differential-heuristic distance cache.
//!
//! A differential heuristic accelerates A*-style pathfinding by preprocessing the map: pick a
//! landmark L, run a full Dijkstra from it, and store each node's distance d(n, L) on the
//! node. The heuristic for a goal g is then `h(n, g) = |d(n, L) - d(g, L)|`, which is
//! admissible and consistent whenever the underlying cost metric is non-negative and
//! monotone. We use a single landmark: our own node. Since most pathfinding runs have our own
//! node at one end, the heuristic is frequently exact, which makes best-first search behave
//! like a straight walk down the shortest path.
//!
//! Because the map changes continuously, the "preprocessing" is really a periodic refresh,
//! performed cooperatively by [`crate::routing::refresh::DhcacheRefresher`] while pathfinding
//! keeps running. To keep readers from ever observing a half-written distance map, each node
//! carries *two* distance slots (see [`NodeInfo::dhcache_distance`]) which this module
//! double-buffers: readers use one slot while the refresher rewrites the other, and a
//! completed refresh atomically flips the roles.
//!
//! Each slot packs a 31-bit distance with a 1-bit visited flag (doubling as a reachability
//! flag for readers). Newly-created nodes get [`DHCACHE_NEWNODE_VALUE`] in both slots -
//! reachable, but at maximum distance - so a node gossip told us about mid-cycle is avoided
//! rather than unroutable.

use crate::routing::gossip::{NodeInfo, ReadOnlyNetworkGraph};

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// The maximum storable distance.
pub const DHCACHE_MAXIMUM_DISTANCE: u32 = 0x7FFF_FFFF;
/// The bits of a distance slot holding the distance itself.
const DHCACHE_DISTANCE_MASK: u32 = 0x7FFF_FFFF;
/// The bit of a distance slot holding the visited/reachable flag.
const DHCACHE_VISITED_MASK: u32 = 0x8000_0000;
/// Both slots of a newly-created node: visited (so readers do not reject it as unreachable)
/// at maximum distance (so pathfinding tends to avoid it until a refresh measures it).
pub(crate) const DHCACHE_NEWNODE_VALUE: u32 = 0xFFFF_FFFF;
/// A slot at the start of a refresh cycle: unvisited, maximum distance.
const DHCACHE_START_REFRESH_VALUE: u32 = 0x7FFF_FFFF;

/// The double-buffering state for the distances stored on every graph node.
///
/// Holds no distances itself - those live on the nodes - just the selector saying which slot
/// belongs to the writer, and whether any refresh has completed yet.
pub struct Dhcache {
	writer_selector: AtomicU8,
	available: AtomicBool,
}

impl Dhcache {
	/// Creates a cache which does not yet contain distance data.
	pub fn new() -> Self {
		Dhcache { writer_selector: AtomicU8::new(0), available: AtomicBool::new(false) }
	}

	/// Whether cached distance data is available, i.e. at least one refresh has completed
	/// and flipped the buffers. Once true, stays true.
	pub fn available(&self) -> bool {
		self.available.load(Ordering::Acquire)
	}

	/// Flips the double-buffering: the slot readers were using becomes the writer's and vice
	/// versa. Any [`DhcacheReader`] or [`DhcacheWriter`] captured earlier is invalidated.
	pub fn flip(&self) {
		self.writer_selector.fetch_xor(1, Ordering::AcqRel);
		self.available.store(true, Ordering::Release);
	}

	/// Captures a reader for pathfinding towards `goal`.
	///
	/// The caller must have checked [`Dhcache::available`]; the returned reader is valid
	/// until the next flip.
	pub fn reader(&self, goal: &NodeInfo) -> DhcacheReader {
		debug_assert!(self.available());
		let selector = (self.writer_selector.load(Ordering::Acquire) ^ 1) as usize;
		let distance_goal = goal.dhcache_distance[selector].load(Ordering::Relaxed)
			& DHCACHE_DISTANCE_MASK;
		DhcacheReader { selector, distance_goal }
	}

	/// Captures a writer for a refresh cycle. Valid until the next flip.
	pub fn writer(&self) -> DhcacheWriter {
		DhcacheWriter { selector: self.writer_selector.load(Ordering::Acquire) as usize }
	}
}

/// A pathfinder's view into the distance cache, pinned to one slot and one goal node.
#[derive(Clone, Copy)]
pub struct DhcacheReader {
	selector: usize,
	distance_goal: u32,
}

impl DhcacheReader {
	/// Whether the node was reached by the refresh cycle backing this reader.
	pub fn is_reachable(&self, node: &NodeInfo) -> bool {
		node.dhcache_distance[self.selector].load(Ordering::Relaxed) & DHCACHE_VISITED_MASK != 0
	}

	/// The heuristic distance from `node` to this reader's goal: the absolute difference of
	/// their landmark distances. Callers should have checked [`DhcacheReader::is_reachable`].
	pub fn distance(&self, node: &NodeInfo) -> u32 {
		let distance_node =
			node.dhcache_distance[self.selector].load(Ordering::Relaxed) & DHCACHE_DISTANCE_MASK;
		if distance_node > self.distance_goal {
			distance_node - self.distance_goal
		} else {
			self.distance_goal - distance_node
		}
	}
}

/// The refresher's view into the distance cache, pinned to the writer slot.
#[derive(Clone, Copy)]
pub struct DhcacheWriter {
	selector: usize,
}

impl DhcacheWriter {
	/// Resets the writer slot of every node in the graph to unvisited-at-maximum-distance,
	/// ready for a fresh Dijkstra.
	pub fn clear_all(&self, graph: &ReadOnlyNetworkGraph) {
		for node in graph.nodes().values() {
			node.dhcache_distance[self.selector].store(DHCACHE_START_REFRESH_VALUE, Ordering::Relaxed);
		}
	}

	/// Whether this refresh cycle has already visited the node.
	pub fn get_visited(&self, node: &NodeInfo) -> bool {
		node.dhcache_distance[self.selector].load(Ordering::Relaxed) & DHCACHE_VISITED_MASK != 0
	}

	/// Marks the node visited.
	pub fn mark_visited(&self, node: &NodeInfo) {
		node.dhcache_distance[self.selector].fetch_or(DHCACHE_VISITED_MASK, Ordering::Relaxed);
	}

	/// The node's current distance from the landmark in this cycle.
	pub fn get_distance(&self, node: &NodeInfo) -> u32 {
		node.dhcache_distance[self.selector].load(Ordering::Relaxed) & DHCACHE_DISTANCE_MASK
	}

	/// Sets the node's distance from the landmark, preserving its visited flag.
	pub fn set_distance(&self, node: &NodeInfo, distance: u32) {
		debug_assert!(distance <= DHCACHE_MAXIMUM_DISTANCE);
		let slot = &node.dhcache_distance[self.selector];
		let visited = slot.load(Ordering::Relaxed) & DHCACHE_VISITED_MASK;
		slot.store(visited | (distance & DHCACHE_DISTANCE_MASK), Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::routing::gossip::NetworkGraph;
	use crate::util::test_utils::{node_id, TestLogger};

	use std::sync::Arc;

	fn graph_with_nodes(count: u8) -> NetworkGraph<Arc<TestLogger>> {
		let graph = NetworkGraph::new(node_id(0), Arc::new(TestLogger::new()));
		for i in 0..count {
			graph.add_channel(i as u64 + 1, node_id(i), node_id(i + 1), None).unwrap();
		}
		graph
	}

	#[test]
	fn new_nodes_read_reachable_at_max_distance() {
		let graph = graph_with_nodes(2);
		let dhcache = Dhcache::new();
		assert!(!dhcache.available());
		dhcache.flip();
		assert!(dhcache.available());

		let read = graph.read_only();
		let reader = dhcache.reader(read.node(&node_id(0)).unwrap());
		let other = read.node(&node_id(2)).unwrap();
		assert!(reader.is_reachable(other));
		// Both at maximum distance, so the differential is zero.
		assert_eq!(reader.distance(other), 0);
	}

	#[test]
	fn writer_and_reader_use_opposite_slots() {
		let graph = graph_with_nodes(1);
		let dhcache = Dhcache::new();

		let writer = dhcache.writer();
		{
			let read = graph.read_only();
			writer.clear_all(&read);
			let node = read.node(&node_id(0)).unwrap();
			assert!(!writer.get_visited(node));
			writer.mark_visited(node);
			writer.set_distance(node, 7);
			assert!(writer.get_visited(node));
			assert_eq!(writer.get_distance(node), 7);
		}
		dhcache.flip();

		let read = graph.read_only();
		let goal = read.node(&node_id(1)).unwrap();
		let reader = dhcache.reader(goal);
		let node = read.node(&node_id(0)).unwrap();
		// The reader now sees the freshly-written slot: node 0 at distance 7, the goal
		// (cleared, never visited) at maximum.
		assert!(reader.is_reachable(node));
		assert_eq!(reader.distance(node), DHCACHE_MAXIMUM_DISTANCE - 7);
		assert!(!reader.is_reachable(goal));
	}

	#[test]
	fn set_distance_preserves_visited_flag() {
		let graph = graph_with_nodes(1);
		let dhcache = Dhcache::new();
		let writer = dhcache.writer();
		let read = graph.read_only();
		writer.clear_all(&read);
		let node = read.node(&node_id(0)).unwrap();
		writer.set_distance(node, 123);
		assert!(!writer.get_visited(node));
		writer.mark_visited(node);
		writer.set_distance(node, 456);
		assert!(writer.get_visited(node));
		assert_eq!(writer.get_distance(node), 456);
	}
}
