// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Repairs a failing route by splicing a two-hop detour around the failed element.
//!
//! When a payment attempt reports an erring channel (or node) partway along a route, a full
//! re-route throws away everything we learned; often the rest of the route is fine and only
//! the failed element needs replacing. This module finds a single intermediate node with a
//! suitable channel from the node before the failure and a suitable channel to the node
//! after it, splices those two hops in place of the failed element, and recomputes the fees
//! and CLTVs of the hops upstream of the splice.
//!
//! The repair deliberately looks no further than one node out: a two-hop splice keeps the
//! query cost at two channel listings, and deeper repairs are better served by a fresh
//! route query.

use crate::routing::gossip::NodeId;
use crate::routing::router::{add_fee, Route, RouteHop, RouteHopStyle};
use crate::rpc::{
	feature_offered, HalfChannel, LightningRpc, RouteExclude, RpcError, OPT_VAR_ONION,
	PAY_ROUTE_NOT_FOUND,
};
use crate::util::logger::Logger;

use core::ops::Deref;

/// A request to repair a failing route.
#[derive(Clone, Debug, PartialEq)]
pub struct PermuteRequest {
	/// The route that failed.
	pub route: Vec<RouteHop>,
	/// The index of the failing hop within `route`.
	pub erring_index: usize,
	/// Whether the failure was the hop's *node* rather than its channel. A node failure
	/// replaces the node itself, a channel failure detours between its two endpoints.
	pub node_failure: bool,
	/// The payer, if not the local node (e.g. when repairing on behalf of a routehint).
	pub source: Option<NodeId>,
	/// Nodes and channels the splice must avoid, typically accumulated from previous
	/// failures of this payment.
	pub excludes: Vec<RouteExclude>,
}

/// Repairs failing routes against the gossip store.
pub struct RoutePermuter<R: Deref, L: Deref>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	rpc: R,
	logger: L,
	local_id: NodeId,
}

struct SpliceEndpoints {
	source_index: usize,
	source_node: NodeId,
	source_out_amount_msat: u64,
	dest_index: usize,
	dest_node: NodeId,
	dest_amount_msat: u64,
	dest_delay: u32,
	dest_style: RouteHopStyle,
	erring_thing: String,
}

impl<R: Deref, L: Deref> RoutePermuter<R, L>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	/// Creates a new permuter. `local_id` is the default payer for requests that do not
	/// carry their own source.
	pub fn new(rpc: R, logger: L, local_id: NodeId) -> Self {
		RoutePermuter { rpc, logger, local_id }
	}

	/// Attempts the repair, returning the modified route.
	///
	/// Any backend failure along the way surfaces as [`PAY_ROUTE_NOT_FOUND`] naming the
	/// sub-command that failed; parameter problems surface as invalid-params errors.
	pub async fn permute(&self, request: &PermuteRequest) -> Result<Route, RpcError> {
		let start_node = request.source.unwrap_or(self.local_id);
		let endpoints = Self::locate_splice(request, &start_node)?;

		// Exclude every node already on the route, plus the payer. The splice only ever
		// *inserts* a node, so this cannot reject the existing route; it just keeps the
		// repair from creating loops, which cost money without helping reliability.
		let mut exclude_nodes: Vec<NodeId> =
			request.route.iter().map(|hop| hop.node_id).collect();
		exclude_nodes.push(start_node);
		for exclude in request.excludes.iter() {
			if let RouteExclude::Node(node) = exclude {
				exclude_nodes.push(*node);
			}
		}

		log_debug!(self.logger, "Repairing route from {} around {} towards {}",
			endpoints.source_node, endpoints.erring_thing, endpoints.dest_node);

		// Channels leaving the splice's source which could carry the amount.
		let source_channels = self
			.rpc
			.list_channels_from(&endpoints.source_node)
			.await
			.map_err(|_| Self::rpc_failure("listchannels # source"))?;
		let source_channels: Vec<&HalfChannel> = source_channels
			.iter()
			.filter(|channel| {
				channel.source == endpoints.source_node
					&& endpoints.source_out_amount_msat >= channel.htlc_minimum_msat
					&& endpoints.source_out_amount_msat <= channel.htlc_maximum_msat
					&& !Self::is_excluded_chan(&request.excludes, channel)
					&& !exclude_nodes.contains(&channel.destination)
			})
			.collect();
		if source_channels.is_empty() {
			log_debug!(self.logger, "Repair failed: {} has no usable alternate channels",
				endpoints.source_node);
			return Err(RpcError::new(
				PAY_ROUTE_NOT_FOUND,
				"No other usable channels before 'erring_index'.",
			));
		}

		// Channels arriving at the splice's destination which could deliver the amount; the
		// first one whose far end matches a usable source channel wins.
		let dest_channels = self
			.rpc
			.list_channels_to(&endpoints.dest_node)
			.await
			.map_err(|_| Self::rpc_failure("listchannels # destination"))?;
		let mut splice_pair: Option<(&HalfChannel, &HalfChannel)> = None;
		'outer: for dest_channel in dest_channels.iter() {
			if dest_channel.destination != endpoints.dest_node {
				continue;
			}
			if endpoints.dest_amount_msat < dest_channel.htlc_minimum_msat
				|| endpoints.dest_amount_msat > dest_channel.htlc_maximum_msat
			{
				continue;
			}
			if Self::is_excluded_chan(&request.excludes, dest_channel) {
				continue;
			}
			// No excluded-node check here: an excluded intermediate was already filtered
			// out of the source set, so it can never match below.
			for source_channel in source_channels.iter() {
				if dest_channel.source == source_channel.destination {
					splice_pair = Some((source_channel, dest_channel));
					break 'outer;
				}
			}
		}
		let (hop1_channel, hop2_channel) = match splice_pair {
			Some(pair) => pair,
			None => {
				log_debug!(self.logger, "Repair failed: no intermediate node bridges {} and {}",
					endpoints.source_node, endpoints.dest_node);
				return Err(RpcError::new(
					PAY_ROUTE_NOT_FOUND,
					"No route to fix 'erring_index'.",
				));
			},
		};

		self.build_spliced_route(request, &endpoints, hop1_channel, hop2_channel).await
	}

	/// Works out which route indices the splice replaces and what must arrive at the far
	/// side of it, validating the request along the way.
	fn locate_splice(
		request: &PermuteRequest, start_node: &NodeId,
	) -> Result<SpliceEndpoints, RpcError> {
		if request.route.is_empty() {
			return Err(RpcError::invalid_params("'route' cannot be empty."));
		}
		if request.node_failure && request.erring_index == 0 {
			return Err(RpcError::invalid_params(
				"'erring_index' cannot be 0 for node failures.",
			));
		}
		if request.erring_index >= request.route.len() {
			return Err(RpcError::invalid_params("'erring_index' cannot exceed 'route' length."));
		}

		let (source_index, erring_thing) = if request.node_failure {
			(request.erring_index - 1, format!("{}", request.route[request.erring_index - 1].node_id))
		} else {
			(request.erring_index, format!("{}", request.route[request.erring_index].short_channel_id))
		};
		let dest_index = request.erring_index + 1;

		let source_node = if source_index == 0 {
			*start_node
		} else {
			request.route[source_index - 1].node_id
		};
		let dest_hop = &request.route[dest_index - 1];

		Ok(SpliceEndpoints {
			source_index,
			source_node,
			source_out_amount_msat: request.route[source_index].amount_msat,
			dest_index,
			dest_node: dest_hop.node_id,
			dest_amount_msat: dest_hop.amount_msat,
			dest_delay: dest_hop.delay,
			dest_style: dest_hop.style,
			erring_thing,
		})
	}

	async fn build_spliced_route(
		&self, request: &PermuteRequest, endpoints: &SpliceEndpoints, hop1_channel: &HalfChannel,
		hop2_channel: &HalfChannel,
	) -> Result<Route, RpcError> {
		log_debug!(self.logger, "Splicing {} -> {} -> {}",
			hop1_channel.short_channel_id, hop1_channel.destination,
			hop2_channel.short_channel_id);

		// The second spliced hop delivers exactly what the failed element delivered.
		let hop2 = RouteHop {
			node_id: hop2_channel.destination,
			short_channel_id: hop2_channel.short_channel_id,
			direction: hop2_channel.direction,
			amount_msat: endpoints.dest_amount_msat,
			delay: endpoints.dest_delay,
			style: endpoints.dest_style,
		};

		// The first spliced hop pays the intermediate node's forwarding fee and delay.
		let hop1_amount_msat = add_fee(
			hop2.amount_msat,
			hop2_channel.base_fee_msat,
			hop2_channel.fee_per_millionth,
		)
		.ok_or_else(|| {
			log_error!(self.logger, "Route fee overflow.");
			RpcError::new(PAY_ROUTE_NOT_FOUND, "Route fee overflow.")
		})?;
		// The intermediate node is new to the route and its onion payload format is
		// unknown; query its feature bits before committing to a style.
		let intermediate = self
			.rpc
			.list_node(&hop1_channel.destination)
			.await
			.map_err(|_| Self::rpc_failure("listnodes # hop"))?;
		let intermediate = match intermediate {
			Some(node) => node,
			None => {
				// The node can legitimately vanish between the channel listing and here if
				// its last channels closed meanwhile; fail the repair rather than guess.
				log_debug!(self.logger, "Intermediate node {} disappeared after selection",
					hop1_channel.destination);
				return Err(RpcError::new(
					PAY_ROUTE_NOT_FOUND,
					"Intermediate node disappeared in a race condition, cowardly failing.",
				));
			},
		};
		let hop1 = RouteHop {
			node_id: hop1_channel.destination,
			short_channel_id: hop1_channel.short_channel_id,
			direction: hop1_channel.direction,
			amount_msat: hop1_amount_msat,
			delay: hop2.delay + hop2_channel.delay,
			style: if feature_offered(&intermediate.features, OPT_VAR_ONION) {
				RouteHopStyle::Tlv
			} else {
				RouteHopStyle::Legacy
			},
		};

		// What the route prefix must now deliver to the splice's source.
		let prefix_amount_msat =
			add_fee(hop1.amount_msat, hop1_channel.base_fee_msat, hop1_channel.fee_per_millionth)
				.ok_or_else(|| {
					log_error!(self.logger, "Route fee overflow.");
					RpcError::new(PAY_ROUTE_NOT_FOUND, "Route fee overflow.")
				})?;
		let prefix_delay = hop1.delay + hop1_channel.delay;

		let mut hops = Vec::with_capacity(request.route.len() + 1);
		hops.extend_from_slice(&request.route[..endpoints.source_index]);
		Self::adjust_prefix(&mut hops, prefix_amount_msat, prefix_delay);
		hops.push(hop1);
		hops.push(hop2);
		hops.extend_from_slice(&request.route[endpoints.dest_index..]);

		Ok(Route { hops })
	}

	/// Raises the amounts and delays of the copied route prefix so its last hop supplies
	/// what the splice needs. If the prefix already supplies enough, it is left untouched.
	fn adjust_prefix(prefix: &mut [RouteHop], prefix_amount_msat: u64, prefix_delay: u32) {
		let (last_amount_msat, last_delay) = match prefix.last() {
			Some(hop) => (hop.amount_msat, hop.delay),
			None => return,
		};
		let mut amount_delta = prefix_amount_msat.saturating_sub(last_amount_msat);
		let delay_delta = prefix_delay.saturating_sub(last_delay);
		if amount_delta == 0 && delay_delta == 0 {
			return;
		}

		for hop in prefix.iter_mut().rev() {
			hop.amount_msat += amount_delta;
			hop.delay += delay_delta;
			// The raised amounts may cross a proportional-fee rounding boundary at any
			// hop. Rather than re-query every hop's fee rate, overpay by one millisatoshi
			// per hop, which every forwarder will accept.
			amount_delta += 1;
		}
	}

	fn rpc_failure(command: &str) -> RpcError {
		RpcError::new(PAY_ROUTE_NOT_FOUND, format!("Failed RPC command: {}", command))
			.with_command(command)
	}

	fn is_excluded_chan(excludes: &[RouteExclude], channel: &HalfChannel) -> bool {
		excludes.iter().any(|exclude| match exclude {
			RouteExclude::Channel(chan) => {
				chan.scid == channel.short_channel_id && chan.direction == channel.direction
			},
			RouteExclude::Node(_) => false,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::ShortChannelIdDir;
	use crate::util::test_utils::{half_channel, node_id, TestLogger, TestRpc};

	use std::sync::Arc;

	// Route A -> B -> C -> D carrying 1_000_000 msat to D, built the way getroute would,
	// with every channel charging base 1000 / 10ppm and delay 6, final CLTV 9.
	fn failing_route() -> Vec<RouteHop> {
		let amount_d = 1_000_000u64;
		let amount_c = add_fee(amount_d, 1_000, 10).unwrap();
		let amount_b = add_fee(amount_c, 1_000, 10).unwrap();
		vec![
			RouteHop {
				node_id: node_id(2), // B
				short_channel_id: 12,
				direction: half_channel(node_id(1), node_id(2), 12, 1_000, 10, 6).direction,
				amount_msat: amount_b,
				delay: 9 + 6 + 6,
				style: RouteHopStyle::Tlv,
			},
			RouteHop {
				node_id: node_id(3), // C
				short_channel_id: 23,
				direction: half_channel(node_id(2), node_id(3), 23, 1_000, 10, 6).direction,
				amount_msat: amount_c,
				delay: 9 + 6,
				style: RouteHopStyle::Tlv,
			},
			RouteHop {
				node_id: node_id(4), // D
				short_channel_id: 34,
				direction: half_channel(node_id(3), node_id(4), 34, 1_000, 10, 6).direction,
				amount_msat: amount_d,
				delay: 9,
				style: RouteHopStyle::Tlv,
			},
		]
	}

	/// Gossip knows the A-B-C-D chain plus a detour B-F-C around the failing B-C channel.
	fn detour_rpc() -> TestRpc {
		let rpc = TestRpc::new(node_id(1));
		{
			let mut state = rpc.state.lock().unwrap();
			for (a, b, scid) in [(1u8, 2u8, 12u64), (2, 3, 23), (3, 4, 34)] {
				state.channels.push(half_channel(node_id(a), node_id(b), scid, 1_000, 10, 6));
				state.channels.push(half_channel(node_id(b), node_id(a), scid, 1_000, 10, 6));
			}
			// The detour via F = node 5: B-F and F-C.
			for (a, b, scid) in [(2u8, 5u8, 25u64), (5, 3, 53)] {
				state.channels.push(half_channel(node_id(a), node_id(b), scid, 2_000, 20, 12));
				state.channels.push(half_channel(node_id(b), node_id(a), scid, 2_000, 20, 12));
			}
			// F speaks TLV onions.
			state.node_features.insert(node_id(5), vec![0x02, 0x00]);
		}
		rpc
	}

	fn permuter(rpc: &Arc<TestRpc>) -> RoutePermuter<Arc<TestRpc>, Arc<TestLogger>> {
		RoutePermuter::new(Arc::clone(rpc), Arc::new(TestLogger::new()), node_id(1))
	}

	#[tokio::test]
	async fn splices_a_detour_around_a_failed_channel() {
		let rpc = Arc::new(detour_rpc());
		let permuter = permuter(&rpc);
		let route = failing_route();
		let dest_amount = route[1].amount_msat;
		let dest_delay = route[1].delay;

		// Hop index 1 is B -> C via channel 23; a channel failure there should splice
		// B -> F -> C and keep A -> B and C -> D.
		let repaired = permuter
			.permute(&PermuteRequest {
				route: route.clone(),
				erring_index: 1,
				node_failure: false,
				source: None,
				excludes: Vec::new(),
			})
			.await
			.unwrap();

		let sequence = repaired.node_sequence();
		assert_eq!(
			sequence,
			vec![node_id(2), node_id(5), node_id(3), node_id(4)],
		);
		// The failing channel is gone.
		assert!(repaired.hops.iter().all(|hop| hop.short_channel_id != 23));

		// The tail is untouched: C -> D still delivers the original amount and delay.
		let tail = repaired.hops.last().unwrap();
		assert_eq!(tail.amount_msat, 1_000_000);
		assert_eq!(tail.delay, 9);

		// The spliced hops deliver what C originally received, with F's fee and delay
		// layered on top for the B -> F hop.
		let hop_f = &repaired.hops[1];
		let hop_c = &repaired.hops[2];
		assert_eq!(hop_c.amount_msat, dest_amount);
		assert_eq!(hop_c.delay, dest_delay);
		assert_eq!(hop_f.amount_msat, add_fee(dest_amount, 2_000, 20).unwrap());
		assert_eq!(hop_f.delay, dest_delay + 12);
		assert_eq!(hop_f.style, RouteHopStyle::Tlv);

		// Upstream of the splice, amounts and delays decrease monotonically towards the
		// destination and cover the splice's requirements.
		for pair in repaired.hops.windows(2) {
			assert!(pair[0].amount_msat > pair[1].amount_msat);
			assert!(pair[0].delay > pair[1].delay);
		}
		// The hop closest to the splice supplies exactly what the splice needs; hops
		// further upstream would each add one extra msat to guard fee rounding.
		let prefix_amount = add_fee(hop_f.amount_msat, 2_000, 20).unwrap();
		assert_eq!(repaired.hops[0].amount_msat, prefix_amount);
		assert_eq!(repaired.hops[0].delay, hop_f.delay + 12);
	}

	#[tokio::test]
	async fn node_failure_replaces_the_node_itself() {
		let rpc = Arc::new(detour_rpc());
		// A node failure reported at erring index 2 blames C, the node just before the
		// erring hop; the splice then runs from B around C to D. Provide a bridge B-E-D.
		{
			let mut state = rpc.state.lock().unwrap();
			for (a, b, scid) in [(2u8, 6u8, 26u64), (6, 4, 64)] {
				state.channels.push(half_channel(node_id(a), node_id(b), scid, 500, 5, 3));
				state.channels.push(half_channel(node_id(b), node_id(a), scid, 500, 5, 3));
			}
			state.node_features.insert(node_id(6), vec![0x00, 0x00]);
		}
		let permuter = permuter(&rpc);
		let route = failing_route();

		let repaired = permuter
			.permute(&PermuteRequest {
				route,
				erring_index: 2,
				node_failure: true,
				source: None,
				excludes: Vec::new(),
			})
			.await
			.unwrap();

		// C no longer appears; E = node 6 bridges B and D.
		let sequence = repaired.node_sequence();
		assert_eq!(sequence, vec![node_id(2), node_id(6), node_id(4)]);
		// E has no TLV support, so its hop is legacy-style.
		assert_eq!(repaired.hops[1].style, RouteHopStyle::Legacy);
		assert_eq!(repaired.hops.last().unwrap().amount_msat, 1_000_000);
	}

	#[tokio::test]
	async fn unusable_source_channels_fail_cleanly() {
		let rpc = Arc::new(detour_rpc());
		let permuter = permuter(&rpc);
		let route = failing_route();

		// Excluding the only detour channel leaves no way to start a splice.
		let err = permuter
			.permute(&PermuteRequest {
				route,
				erring_index: 1,
				node_failure: false,
				source: None,
				excludes: vec![RouteExclude::Channel(ShortChannelIdDir {
					scid: 25,
					direction: half_channel(node_id(2), node_id(5), 25, 0, 0, 0).direction,
				})],
			})
			.await
			.unwrap_err();
		assert_eq!(err.code, PAY_ROUTE_NOT_FOUND);
	}

	#[tokio::test]
	async fn vanished_intermediate_fails_the_repair() {
		let rpc = Arc::new(detour_rpc());
		{
			// The channel listing still knows F, but the node record is gone.
			let mut state = rpc.state.lock().unwrap();
			state.node_features.remove(&node_id(5));
			state.nodes_absent.insert(node_id(5));
		}
		let permuter = permuter(&rpc);
		let err = permuter
			.permute(&PermuteRequest {
				route: failing_route(),
				erring_index: 1,
				node_failure: false,
				source: None,
				excludes: Vec::new(),
			})
			.await
			.unwrap_err();
		assert_eq!(err.code, PAY_ROUTE_NOT_FOUND);
		assert!(err.message.contains("disappeared"));
	}

	#[tokio::test]
	async fn parameter_validation() {
		let rpc = Arc::new(detour_rpc());
		let permuter = permuter(&rpc);

		let empty = PermuteRequest {
			route: Vec::new(),
			erring_index: 0,
			node_failure: false,
			source: None,
			excludes: Vec::new(),
		};
		assert_eq!(
			permuter.permute(&empty).await.unwrap_err().code,
			crate::rpc::JSONRPC2_INVALID_PARAMS
		);

		let node_failure_at_zero = PermuteRequest {
			route: failing_route(),
			erring_index: 0,
			node_failure: true,
			source: None,
			excludes: Vec::new(),
		};
		assert_eq!(
			permuter.permute(&node_failure_at_zero).await.unwrap_err().code,
			crate::rpc::JSONRPC2_INVALID_PARAMS
		);

		let out_of_range = PermuteRequest {
			route: failing_route(),
			erring_index: 3,
			node_failure: false,
			source: None,
			excludes: Vec::new(),
		};
		assert_eq!(
			permuter.permute(&out_of_range).await.unwrap_err().code,
			crate::rpc::JSONRPC2_INVALID_PARAMS
		);
	}
}
