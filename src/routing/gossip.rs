// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The network map this crate's pathfinding machinery runs over.
//!
//! The map itself is maintained by the node's gossip ingest, which is out of scope here; this
//! module only defines the storage and the maintenance surface that ingest drives. Readers
//! take the [`NetworkGraph::read_only`] view; the one in-crate writer of per-node state is
//! the distance-cache refresher, which confines itself to the atomic distance slots so it can
//! run under the same read view.

use crate::routing::dhcache::DHCACHE_NEWNODE_VALUE;
use crate::util::logger::Logger;

use core::cmp;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::AtomicU32;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};

/// The size of a serialized compressed public key, and thus of a node id.
pub const PUBLIC_KEY_SIZE: usize = 33;

/// Represents the compressed public key of a node
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct NodeId([u8; PUBLIC_KEY_SIZE]);

impl NodeId {
	/// Create a new NodeId from the serialized form of a public key.
	pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
		NodeId(bytes)
	}

	/// Get the public key slice from this NodeId.
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Debug for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "NodeId({})", log_bytes!(self.0))
	}
}
impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", log_bytes!(self.0))
	}
}

impl cmp::PartialOrd for NodeId {
	fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl cmp::Ord for NodeId {
	fn cmp(&self, other: &Self) -> cmp::Ordering {
		self.0[..].cmp(&other.0[..])
	}
}

/// Fees for routing via a given channel in a given direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RoutingFees {
	/// Flat routing fee in millisatoshis.
	pub base_msat: u32,
	/// Liquidity-based routing fee in millionths of a routed amount. In other words, 10000
	/// is 1%.
	pub proportional_millionths: u32,
}

/// Details about one direction of a channel, as advertised by its source node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUpdateInfo {
	/// When the last update to the channel direction was issued.
	/// Value is opaque, as set in the announcement.
	pub last_update: u32,
	/// Whether the channel can be currently used for payments (in this one direction).
	pub enabled: bool,
	/// The difference in CLTV values that you must have when routing through this channel.
	pub cltv_expiry_delta: u16,
	/// The minimum value, which must be relayed to the next hop via the channel
	pub htlc_minimum_msat: u64,
	/// The maximum value which may be relayed to the next hop via the channel.
	pub htlc_maximum_msat: u64,
	/// Fees charged when the channel is used for routing
	pub fees: RoutingFees,
}

/// Details about a channel (both directions).
///
/// `node_one` is always the lexically-lesser node id, so direction 0 is one-to-two and
/// direction 1 is two-to-one.
#[derive(Debug)]
pub struct ChannelInfo {
	/// Source node of the first direction of a channel
	pub node_one: NodeId,
	/// Details about the first direction of a channel
	pub one_to_two: Option<ChannelUpdateInfo>,
	/// Source node of the second direction of a channel
	pub node_two: NodeId,
	/// Details about the second direction of a channel
	pub two_to_one: Option<ChannelUpdateInfo>,
	/// The channel capacity as seen on-chain, if chain lookup is available.
	pub capacity_sats: Option<u64>,
}

impl ChannelInfo {
	/// Which direction has the given node as its source, if either.
	pub fn direction_from(&self, source: &NodeId) -> Option<u8> {
		if *source == self.node_one {
			Some(0)
		} else if *source == self.node_two {
			Some(1)
		} else {
			None
		}
	}

	/// The advertised parameters of the given direction, if an update has been received.
	pub fn update_for(&self, direction: u8) -> Option<&ChannelUpdateInfo> {
		match direction {
			0 => self.one_to_two.as_ref(),
			_ => self.two_to_one.as_ref(),
		}
	}

	/// The node at the far end of this channel from `from`, if `from` is an endpoint.
	pub fn other_node(&self, from: &NodeId) -> Option<&NodeId> {
		if *from == self.node_one {
			Some(&self.node_two)
		} else if *from == self.node_two {
			Some(&self.node_one)
		} else {
			None
		}
	}
}

/// Details about a node in the network, known from the network announcement.
pub struct NodeInfo {
	/// All valid channels a node has announced
	pub channels: Vec<u64>,
	/// The two distance-to-landmark slots the distance cache double-buffers between. Written
	/// only by the cache refresher; see [`crate::routing::dhcache`] for the encoding.
	pub dhcache_distance: [AtomicU32; 2],
}

impl NodeInfo {
	fn new() -> Self {
		NodeInfo {
			channels: Vec::new(),
			// New nodes are born reachable-at-maximum-distance so pathfinding between
			// refreshes avoids rather than rejects them.
			dhcache_distance: [
				AtomicU32::new(DHCACHE_NEWNODE_VALUE),
				AtomicU32::new(DHCACHE_NEWNODE_VALUE),
			],
		}
	}
}

impl fmt::Debug for NodeInfo {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "NodeInfo {{ channels: {:?} }}", &self.channels[..])
	}
}

/// An error from a [`NetworkGraph`] maintenance operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphError {
	/// The short channel id is already present in the graph.
	DuplicateChannel,
	/// The short channel id is not present in the graph.
	UnknownChannel,
}

/// Represents the network as nodes and channels between them
pub struct NetworkGraph<L: Deref>
where
	L::Target: Logger,
{
	local_id: NodeId,
	logger: L,
	// Lock order: channels -> nodes
	channels: RwLock<HashMap<u64, ChannelInfo>>,
	nodes: RwLock<HashMap<NodeId, NodeInfo>>,
}

/// A read-only view of [`NetworkGraph`].
pub struct ReadOnlyNetworkGraph<'a> {
	channels: RwLockReadGuard<'a, HashMap<u64, ChannelInfo>>,
	nodes: RwLockReadGuard<'a, HashMap<NodeId, NodeInfo>>,
}

impl<L: Deref> NetworkGraph<L>
where
	L::Target: Logger,
{
	/// Creates a new, empty network graph with the given local node id as its landmark.
	pub fn new(local_id: NodeId, logger: L) -> Self {
		NetworkGraph {
			local_id,
			logger,
			channels: RwLock::new(HashMap::new()),
			nodes: RwLock::new(HashMap::new()),
		}
	}

	/// The local node's id, which distance refreshes measure from.
	pub fn local_id(&self) -> NodeId {
		self.local_id
	}

	/// Adds a newly-announced channel between two nodes, creating either node if this is the
	/// first channel it appears in. The given order of the endpoints is not significant.
	pub fn add_channel(
		&self, short_channel_id: u64, node_a: NodeId, node_b: NodeId, capacity_sats: Option<u64>,
	) -> Result<(), GraphError> {
		let (node_one, node_two) = if node_a < node_b { (node_a, node_b) } else { (node_b, node_a) };
		let mut channels = self.channels.write().unwrap();
		let mut nodes = self.nodes.write().unwrap();
		if channels.contains_key(&short_channel_id) {
			return Err(GraphError::DuplicateChannel);
		}
		channels.insert(
			short_channel_id,
			ChannelInfo { node_one, one_to_two: None, node_two, two_to_one: None, capacity_sats },
		);
		for node_id in [node_one, node_two] {
			nodes.entry(node_id).or_insert_with(NodeInfo::new).channels.push(short_channel_id);
		}
		log_gossip!(self.logger, "Added channel {} between {} and {}",
			short_channel_id, node_one, node_two);
		Ok(())
	}

	/// Applies a channel update to one direction of an existing channel.
	pub fn update_channel(
		&self, short_channel_id: u64, direction: u8, update: ChannelUpdateInfo,
	) -> Result<(), GraphError> {
		let mut channels = self.channels.write().unwrap();
		let channel = channels.get_mut(&short_channel_id).ok_or(GraphError::UnknownChannel)?;
		if direction == 0 {
			channel.one_to_two = Some(update);
		} else {
			channel.two_to_one = Some(update);
		}
		Ok(())
	}

	/// Removes a channel, forgetting either endpoint if this was its last channel.
	pub fn remove_channel(&self, short_channel_id: u64) {
		let mut channels = self.channels.write().unwrap();
		let mut nodes = self.nodes.write().unwrap();
		if let Some(channel) = channels.remove(&short_channel_id) {
			for node_id in [channel.node_one, channel.node_two] {
				if let Some(node) = nodes.get_mut(&node_id) {
					node.channels.retain(|scid| *scid != short_channel_id);
					if node.channels.is_empty() {
						nodes.remove(&node_id);
					}
				}
			}
			log_gossip!(self.logger, "Removed channel {}", short_channel_id);
		}
	}

	/// Removes a node and every channel it participates in.
	pub fn remove_node(&self, node_id: &NodeId) {
		let scids = {
			let nodes = self.nodes.read().unwrap();
			match nodes.get(node_id) {
				Some(node) => node.channels.clone(),
				None => return,
			}
		};
		for scid in scids {
			self.remove_channel(scid);
		}
		// A node with no channels left was already dropped by remove_channel, but a node
		// which never had a channel still needs removing here.
		self.nodes.write().unwrap().remove(node_id);
		log_gossip!(self.logger, "Removed node {}", node_id);
	}

	/// Returns a read-only view of the network graph.
	pub fn read_only(&'_ self) -> ReadOnlyNetworkGraph<'_> {
		let channels = self.channels.read().unwrap();
		let nodes = self.nodes.read().unwrap();
		ReadOnlyNetworkGraph { channels, nodes }
	}
}

impl<'a> ReadOnlyNetworkGraph<'a> {
	/// Returns all known valid channels' short ids along with announced channel info.
	pub fn channels(&self) -> &HashMap<u64, ChannelInfo> {
		&*self.channels
	}

	/// Returns information on a channel with the given id.
	pub fn channel(&self, short_channel_id: u64) -> Option<&ChannelInfo> {
		self.channels.get(&short_channel_id)
	}

	/// Returns all known nodes' public keys along with announced node info.
	pub fn nodes(&self) -> &HashMap<NodeId, NodeInfo> {
		&*self.nodes
	}

	/// Returns information on a node with the given id.
	pub fn node(&self, node_id: &NodeId) -> Option<&NodeInfo> {
		self.nodes.get(node_id)
	}
}
