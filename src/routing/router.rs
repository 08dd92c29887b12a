// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The route representation shared by the shortest-route backend, the diversity engine and
//! route repair, plus the fee arithmetic they all agree on.

use crate::routing::gossip::NodeId;

/// How the per-hop onion payload for a hop should be encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteHopStyle {
	/// The fixed-format legacy payload.
	Legacy,
	/// The variable-length TLV payload.
	Tlv,
}

/// A hop in a route.
///
/// Amounts and delays are those *arriving at* this hop: the amount at hop i equals the
/// delivered amount plus the fees of every hop after i, and the delay at hop i is the
/// absolute CLTV the HTLC to this hop carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteHop {
	/// The node reached by this hop.
	pub node_id: NodeId,
	/// The channel used from the previous hop to reach this node.
	pub short_channel_id: u64,
	/// Which half of that channel is traversed, 0 or 1.
	pub direction: u8,
	/// The amount forwarded to this hop, in millisatoshis.
	pub amount_msat: u64,
	/// The absolute CLTV of the HTLC arriving at this hop, in blocks.
	pub delay: u32,
	/// How this hop's onion payload should be encoded.
	pub style: RouteHopStyle,
}

/// A route from the payer to a destination. Hops do not include the payer itself; the last
/// hop is the destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
	/// The hops, in traversal order. Never empty for a route produced by this crate.
	pub hops: Vec<RouteHop>,
}

impl Route {
	/// The total fee this route charges on top of `delivered_msat`, or `None` if the route
	/// claims to forward less than it delivers (which indicates a broken backend).
	pub fn fee_msat(&self, delivered_msat: u64) -> Option<u64> {
		self.hops.first()?.amount_msat.checked_sub(delivered_msat)
	}

	/// The node sequence of this route, used to compare routes for sameness.
	pub fn node_sequence(&self) -> Vec<NodeId> {
		self.hops.iter().map(|hop| hop.node_id).collect()
	}
}

/// Adds a forwarding node's fee to an amount: the node forwards `amount_msat` onward and
/// charges `base_fee_msat` plus `fee_per_millionth` of the forwarded amount (rounded down).
/// Returns `None` on overflow.
pub fn add_fee(amount_msat: u64, base_fee_msat: u64, fee_per_millionth: u32) -> Option<u64> {
	let proportional = (amount_msat as u128 * fee_per_millionth as u128 / 1_000_000) as u64;
	amount_msat.checked_add(base_fee_msat)?.checked_add(proportional)
}
