// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Turns a shortest-route primitive into a stream of *distinct* routes.
//!
//! Sub-payments which all travel the same path defeat the point of splitting a payment: they
//! pile HTLCs onto the same channels and share the same failure modes. This module generates
//! route alternatives by walking a conceptual tree. The root is the unconstrained shortest
//! route; each child of a route bans the channels of one of its parent's hops (on top of
//! every ban inherited from its ancestors) and re-runs the shortest-route query. Traversal is
//! breadth-first: the fewer bans, the shorter and cheaper the resulting route tends to be, so
//! shallow tree nodes are tried first.
//!
//! A tree position is represented by its last-added ban: a [`DiversityEdge`] naming a node
//! pair, holding a shared reference to its parent edge. Walking an edge's parent chain
//! enumerates the full ban set, and shared ownership keeps ancestors alive exactly as long as
//! some queued descendant needs them. Banning is by node *pair*, not by channel: peers often
//! have several parallel channels, and per the onion spec a forwarding node may substitute
//! any channel to the same peer, so every channel direction between the two endpoints is
//! excluded together.
//!
//! Requests for the same destination are serialised, first come first served. Two concurrent
//! requests starting from the same queue state would generate the same route, which is
//! exactly what this module exists to avoid - and the shortest-route backend serialises its
//! queries anyway, so nothing is lost by queueing here where previous answers can seed later
//! attempts.

use crate::routing::gossip::NodeId;
use crate::routing::router::Route;
use crate::rpc::{
	LightningRpc, RouteExclude, RouteRequest, RpcError, ShortChannelIdDir,
	PAY_ROUTE_NOT_FOUND, PAY_ROUTE_TOO_EXPENSIVE,
};
use crate::util::logger::Logger;

use core::ops::Deref;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// One banned node pair in the diversity tree, chained to the bans it inherits.
///
/// Children hold strong references to their parents, so an edge lives for as long as any
/// descendant sits in some queue; dropping the last holder releases the parent reference,
/// cascading up the chain.
pub struct DiversityEdge {
	source: NodeId,
	destination: NodeId,
	parent: Option<Arc<DiversityEdge>>,
}

impl DiversityEdge {
	fn new(source: NodeId, destination: NodeId, parent: Option<Arc<DiversityEdge>>) -> Arc<Self> {
		Arc::new(DiversityEdge { source, destination, parent })
	}

	/// The edges on the path from this edge to the root of its tree, starting with this
	/// edge itself. This is exactly the ban set of the tree position it represents.
	pub fn chain(self: &Arc<Self>) -> Vec<Arc<DiversityEdge>> {
		let mut chain = Vec::new();
		let mut cursor = Some(Arc::clone(self));
		while let Some(edge) = cursor {
			cursor = edge.parent.clone();
			chain.push(edge);
		}
		chain
	}
}

/// Previously-emitted routes for a destination, compared hop-for-hop by node sequence.
struct RouteCache {
	routes: Vec<Vec<NodeId>>,
}

impl RouteCache {
	fn new() -> Self {
		RouteCache { routes: Vec::new() }
	}

	/// True if the route was not yet known and has now been inserted, false if it was
	/// already present.
	fn lookup_or_insert(&mut self, route: &Route) -> bool {
		let sequence = route.node_sequence();
		// Scan in reverse: we tend to emit short routes first and append new ones at the
		// end, so a duplicate is most likely among the recent entries.
		if self.routes.iter().rev().any(|known| *known == sequence) {
			return false;
		}
		self.routes.push(sequence);
		true
	}

	fn clear(&mut self) {
		self.routes.clear();
	}
}

/// The tree-traversal state for one destination.
struct DiversityTree {
	/// Edges generated but not yet expanded, in breadth-first order.
	queue: VecDeque<Arc<DiversityEdge>>,
	cache: RouteCache,
}

struct DiversityDestination {
	/// Serialises requests to this destination. `tokio`'s mutex queues waiters fairly, so
	/// requests run strictly first come first served.
	tree: tokio::sync::Mutex<DiversityTree>,
}

/// What this engine needs to know about the payment (attempt) requesting routes.
///
/// The exclude set is owned by the payment and shared across its requests; on a budget
/// failure the engine adds a repair hint to it so the caller's retry avoids the worst
/// offender.
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentAttempt {
	/// The node to route to.
	pub destination: NodeId,
	/// The amount to deliver, in millisatoshis.
	pub amount_msat: u64,
	/// The CLTV delta the destination requires.
	pub final_cltv: u32,
	/// How strongly to prefer short lockups over low fees, in percent per annum.
	pub riskfactor: f64,
	/// The longest acceptable route, in hops.
	pub max_hops: u32,
	/// The most this payment is willing to spend on fees, in millisatoshis.
	pub fee_budget_msat: u64,
	/// The highest acceptable total CLTV, in blocks.
	pub cltv_budget: u32,
	/// Channels and nodes this payment must avoid, before any diversity bans.
	pub excludes: Vec<RouteExclude>,
}

/// Why a diversity request failed.
#[derive(Clone, Debug, PartialEq)]
pub enum RouteError {
	/// No route exists even without diversity bans; the underlying error is attached.
	Unreachable(RpcError),
	/// The best possible route's fee exceeds the payment's fee budget. A repair hint has
	/// been added to the payment's excludes.
	FeeBudgetExceeded {
		/// The fee of the rejected route, in millisatoshis.
		fee_msat: u64,
		/// The budget it exceeded, in millisatoshis.
		budget_msat: u64,
	},
	/// The best possible route's total CLTV exceeds the payment's CLTV budget. A repair
	/// hint has been added to the payment's excludes.
	CltvBudgetExceeded {
		/// The total CLTV of the rejected route, in blocks.
		delay: u32,
		/// The budget it exceeded, in blocks.
		budget: u32,
	},
	/// Some auxiliary backend query failed.
	Rpc(RpcError),
}

impl RouteError {
	/// Flattens this error into the RPC error surfaced to the payer.
	pub fn to_rpc_error(&self) -> RpcError {
		match self {
			RouteError::Unreachable(inner) => RpcError::new(
				PAY_ROUTE_NOT_FOUND,
				format!("Error computing a route: {}", inner),
			),
			RouteError::FeeBudgetExceeded { fee_msat, budget_msat } => RpcError::new(
				PAY_ROUTE_TOO_EXPENSIVE,
				format!("Fee exceeds our fee budget: {} > {}, discarding route", fee_msat, budget_msat),
			),
			RouteError::CltvBudgetExceeded { delay, budget } => RpcError::new(
				PAY_ROUTE_TOO_EXPENSIVE,
				format!("CLTV delay exceeds our CLTV budget: {} > {}", delay, budget),
			),
			RouteError::Rpc(inner) => inner.clone(),
		}
	}
}

enum ConstraintViolation {
	Ok,
	OutOfFees(u64),
	OutOfTime(u32),
}

/// The path-diversity engine. One per node; destinations spring into being on first use.
pub struct PathDiversity<R: Deref, L: Deref>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	rpc: R,
	logger: L,
	local_id: NodeId,
	destinations: Mutex<HashMap<NodeId, Arc<DiversityDestination>>>,
}

impl<R: Deref, L: Deref> PathDiversity<R, L>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	/// Creates a new engine routing from the given local node.
	pub fn new(rpc: R, logger: L, local_id: NodeId) -> Self {
		PathDiversity { rpc, logger, local_id, destinations: Mutex::new(HashMap::new()) }
	}

	/// Produces the next diverse route for the given payment.
	///
	/// Concurrent calls for the same destination are serialised in arrival order; calls for
	/// different destinations are independent. On a budget failure the payment's exclude
	/// set is extended with a repair hint (the most expensive or longest-delay hop of the
	/// rejected route).
	pub async fn get_route(&self, payment: &mut PaymentAttempt) -> Result<Route, RouteError> {
		let destination = self.checkout_destination(payment.destination);
		let result = {
			let mut tree = destination.tree.lock().await;
			self.get_route_serialised(&mut tree, payment).await
		};
		self.release_destination(payment.destination, destination);
		result
	}

	fn checkout_destination(&self, node: NodeId) -> Arc<DiversityDestination> {
		let mut destinations = self.destinations.lock().unwrap();
		let destination = destinations.entry(node).or_insert_with(|| {
			Arc::new(DiversityDestination {
				tree: tokio::sync::Mutex::new(DiversityTree {
					queue: VecDeque::new(),
					cache: RouteCache::new(),
				}),
			})
		});
		// Every request holds a clone for its whole lifetime, so the map entry's reference
		// count doubles as the waiter count.
		Arc::clone(destination)
	}

	fn release_destination(&self, node: NodeId, destination: Arc<DiversityDestination>) {
		let mut destinations = self.destinations.lock().unwrap();
		drop(destination);
		if let Some(entry) = destinations.get(&node) {
			// Our clone is dropped; if the map now holds the only reference left, no
			// request is using or awaiting this destination and it can be forgotten.
			if Arc::strong_count(entry) == 1 {
				destinations.remove(&node);
			}
		}
	}

	async fn get_route_serialised(
		&self, tree: &mut DiversityTree, payment: &mut PaymentAttempt,
	) -> Result<Route, RouteError> {
		loop {
			let edge = tree.queue.pop_front();
			if edge.is_none() {
				// (Re)starting at the tree root: every route will be generated afresh, so
				// forget the ones from the previous pass.
				tree.cache.clear();
			}

			let bans = self.collect_exclusions(edge.as_ref()).await?;
			let route = match self.query_route(payment, bans).await {
				Ok(route) => route,
				Err(err) => {
					if edge.is_none() {
						// No route even at the tree root, i.e. with only the payment's own
						// excludes: the destination is simply not reachable.
						return Err(RouteError::Unreachable(err));
					}
					log_debug!(self.logger,
						"No route to {} with diversity bans, dropping tree node: {}",
						payment.destination, err);
					continue;
				},
			};

			if !tree.cache.lookup_or_insert(&route) {
				// Already emitted this exact route; this tree node adds nothing.
				continue;
			}

			match self.check_constraints(payment, &route)? {
				ConstraintViolation::Ok => {},
				ConstraintViolation::OutOfFees(fee_msat) => {
					if edge.is_none() {
						exclude_most_expensive(payment, &route);
						return Err(RouteError::FeeBudgetExceeded {
							fee_msat,
							budget_msat: payment.fee_budget_msat,
						});
					}
					// Deeper tree nodes only get longer and dearer; restart from the root
					// (the empty queue) and let the root decide whether to give up.
					tree.queue.clear();
					continue;
				},
				ConstraintViolation::OutOfTime(delay) => {
					if edge.is_none() {
						exclude_longest_delay(payment, &route);
						return Err(RouteError::CltvBudgetExceeded {
							delay,
							budget: payment.cltv_budget,
						});
					}
					tree.queue.clear();
					continue;
				},
			}

			// Seed the next tree level: one child per hop, each inheriting this position's
			// bans through the parent link.
			let mut previous = self.local_id;
			for hop in route.hops.iter() {
				tree.queue.push_back(DiversityEdge::new(previous, hop.node_id, edge.clone()));
				previous = hop.node_id;
			}

			return Ok(route);
		}
	}

	/// Expands an edge (and its ancestors) into concrete channel bans: every channel
	/// direction between each banned node pair.
	async fn collect_exclusions(
		&self, edge: Option<&Arc<DiversityEdge>>,
	) -> Result<Vec<ShortChannelIdDir>, RouteError> {
		let mut excludes = Vec::new();
		let chain = match edge {
			Some(edge) => edge.chain(),
			None => return Ok(excludes),
		};
		for link in chain.iter() {
			let channels = self
				.rpc
				.list_channels_from(&link.source)
				.await
				.map_err(|err| RouteError::Rpc(err.with_command("listchannels")))?;
			for channel in channels.iter() {
				if channel.destination != link.destination {
					continue;
				}
				for direction in 0..2u8 {
					excludes.push(ShortChannelIdDir {
						scid: channel.short_channel_id,
						direction,
					});
				}
			}
		}
		Ok(excludes)
	}

	async fn query_route(
		&self, payment: &PaymentAttempt, bans: Vec<ShortChannelIdDir>,
	) -> Result<Route, RpcError> {
		if !bans.is_empty() {
			log_debug!(self.logger, "Diversity getroute to {} with {} additional excludes",
				payment.destination, bans.len());
		}
		let mut excludes = payment.excludes.clone();
		excludes.extend(bans.into_iter().map(RouteExclude::Channel));
		let request = RouteRequest {
			destination: payment.destination,
			amount_msat: payment.amount_msat,
			final_cltv: payment.final_cltv,
			riskfactor: payment.riskfactor,
			max_hops: payment.max_hops,
			excludes,
		};
		self.rpc.get_route(&request).await
	}

	fn check_constraints(
		&self, payment: &PaymentAttempt, route: &Route,
	) -> Result<ConstraintViolation, RouteError> {
		let fee_msat = match route.fee_msat(payment.amount_msat) {
			Some(fee) => fee,
			None => {
				return Err(RouteError::Rpc(RpcError::new(
					crate::rpc::JSONRPC2_INTERNAL_ERROR,
					format!(
						"getroute returned a route with negative fee: sending {} to deliver {}",
						route.hops.first().map(|hop| hop.amount_msat).unwrap_or(0),
						payment.amount_msat
					),
				)))
			},
		};
		if fee_msat > payment.fee_budget_msat {
			return Ok(ConstraintViolation::OutOfFees(fee_msat));
		}
		let delay = route.hops.first().map(|hop| hop.delay).unwrap_or(0);
		if delay > payment.cltv_budget {
			return Ok(ConstraintViolation::OutOfTime(delay));
		}
		Ok(ConstraintViolation::Ok)
	}
}

/// Adds the channel of the route's costliest hop to the payment's excludes, so a retry
/// avoids it. The costliest hop is the one with the largest fee step between it and its
/// successor; a single-hop route blames its only hop.
fn exclude_most_expensive(payment: &mut PaymentAttempt, route: &Route) {
	let mut worst: Option<(u64, &crate::routing::router::RouteHop)> = None;
	for pair in route.hops.windows(2) {
		let fee = pair[0].amount_msat.saturating_sub(pair[1].amount_msat);
		if worst.map_or(true, |(worst_fee, _)| fee > worst_fee) {
			worst = Some((fee, &pair[0]));
		}
	}
	let hop = match worst {
		Some((_, hop)) => hop,
		None => match route.hops.first() {
			Some(hop) => hop,
			None => return,
		},
	};
	payment.excludes.push(RouteExclude::Channel(ShortChannelIdDir {
		scid: hop.short_channel_id,
		direction: hop.direction,
	}));
}

/// Adds the channel of the route's longest-delay hop to the payment's excludes. The
/// longest-delay hop is the one with the largest CLTV step between it and its successor; a
/// single-hop route blames its only hop.
fn exclude_longest_delay(payment: &mut PaymentAttempt, route: &Route) {
	let mut worst: Option<(u32, &crate::routing::router::RouteHop)> = None;
	for pair in route.hops.windows(2) {
		let delay = pair[0].delay.saturating_sub(pair[1].delay);
		if worst.map_or(true, |(worst_delay, _)| delay > worst_delay) {
			worst = Some((delay, &pair[0]));
		}
	}
	let hop = match worst {
		Some((_, hop)) => hop,
		None => match route.hops.first() {
			Some(hop) => hop,
			None => return,
		},
	};
	payment.excludes.push(RouteExclude::Channel(ShortChannelIdDir {
		scid: hop.short_channel_id,
		direction: hop.direction,
	}));
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::{channel_pair, node_id, TestLogger, TestRpc};

	use std::sync::Arc;

	/// A diamond: us (node 0) to node 3, either via node 1 (cheap) or via node 2 (dearer),
	/// plus a long tail 0-1-2-3 alternative through the cross channel 1-2.
	fn diamond_rpc() -> TestRpc {
		let rpc = TestRpc::new(node_id(0));
		{
			let mut state = rpc.state.lock().unwrap();
			state.channels.extend(channel_pair(node_id(0), node_id(1), 1, 1_000, 10, 6));
			state.channels.extend(channel_pair(node_id(1), node_id(3), 2, 1_000, 10, 6));
			state.channels.extend(channel_pair(node_id(0), node_id(2), 3, 2_000, 10, 6));
			state.channels.extend(channel_pair(node_id(2), node_id(3), 4, 2_000, 10, 6));
			state.channels.extend(channel_pair(node_id(1), node_id(2), 5, 1_500, 10, 6));
		}
		rpc
	}

	fn payment_to(destination: NodeId) -> PaymentAttempt {
		PaymentAttempt {
			destination,
			amount_msat: 1_000_000,
			final_cltv: 9,
			riskfactor: 10.0,
			max_hops: 20,
			fee_budget_msat: 50_000,
			cltv_budget: 2_016,
			excludes: Vec::new(),
		}
	}

	fn engine(rpc: &Arc<TestRpc>) -> PathDiversity<Arc<TestRpc>, Arc<TestLogger>> {
		PathDiversity::new(Arc::clone(rpc), Arc::new(TestLogger::new()), node_id(0))
	}

	#[tokio::test]
	async fn successive_requests_return_distinct_routes() {
		let rpc = Arc::new(diamond_rpc());
		let diversity = engine(&rpc);
		let mut payment = payment_to(node_id(3));

		let mut seen = Vec::new();
		// The diamond admits several loop-free routes; successive requests must not repeat
		// any of them.
		for _ in 0..3 {
			let route = diversity.get_route(&mut payment).await.unwrap();
			let sequence = route.node_sequence();
			assert!(!seen.contains(&sequence), "duplicate route {:?}", sequence);
			seen.push(sequence);
		}
		// The first route is the true shortest one.
		assert_eq!(seen[0], vec![node_id(1), node_id(3)]);
	}

	#[tokio::test]
	async fn parallel_channels_are_banned_together() {
		let rpc = Arc::new(diamond_rpc());
		{
			// A second, parallel channel between node 1 and node 3.
			let mut state = rpc.state.lock().unwrap();
			state.channels.extend(channel_pair(node_id(1), node_id(3), 99, 900, 10, 6));
		}
		let diversity = engine(&rpc);
		let mut payment = payment_to(node_id(3));

		let first = diversity.get_route(&mut payment).await.unwrap();
		assert_eq!(first.node_sequence(), vec![node_id(1), node_id(3)]);

		// Keep walking the tree until the edge banning the 1-3 pair has been expanded.
		let second = diversity.get_route(&mut payment).await.unwrap();
		assert_ne!(second.node_sequence(), first.node_sequence());
		let third = diversity.get_route(&mut payment).await.unwrap();
		assert_ne!(third.node_sequence(), first.node_sequence());
		assert_ne!(third.node_sequence(), second.node_sequence());

		// Expanding the 1-3 ban must have fed getroute an exclude list covering both
		// parallel channels, in both directions.
		let requests = rpc.state.lock().unwrap().route_requests.clone();
		let banned_both = requests.iter().any(|request| {
			let has = |scid: u64, direction: u8| {
				request.excludes.iter().any(|exclude| match exclude {
					RouteExclude::Channel(chan) => chan.scid == scid && chan.direction == direction,
					_ => false,
				})
			};
			has(2, 0) && has(2, 1) && has(99, 0) && has(99, 1)
		});
		assert!(banned_both, "no getroute banned both parallel channels: {:?}", requests);
	}

	#[test]
	fn ban_chain_matches_path_to_root() {
		let root_edge = DiversityEdge::new(node_id(0), node_id(1), None);
		let child = DiversityEdge::new(node_id(1), node_id(2), Some(Arc::clone(&root_edge)));
		let grandchild = DiversityEdge::new(node_id(2), node_id(3), Some(Arc::clone(&child)));

		let chain = grandchild.chain();
		assert_eq!(chain.len(), 3);
		assert_eq!(chain[0].source, node_id(2));
		assert_eq!(chain[1].source, node_id(1));
		assert_eq!(chain[2].source, node_id(0));

		// Dropping intermediate handles must not free ancestors still referenced through
		// descendants.
		drop(child);
		drop(root_edge);
		let chain = grandchild.chain();
		assert_eq!(chain.len(), 3);
		assert_eq!(chain[2].destination, node_id(1));
	}

	#[tokio::test]
	async fn unreachable_destination_fails_at_the_root() {
		let rpc = Arc::new(diamond_rpc());
		let diversity = engine(&rpc);
		// Node 9 does not exist.
		let mut payment = payment_to(node_id(9));
		match diversity.get_route(&mut payment).await {
			Err(RouteError::Unreachable(inner)) => assert_eq!(inner.code, PAY_ROUTE_NOT_FOUND),
			other => panic!("expected Unreachable, got {:?}", other.map(|r| r.node_sequence())),
		}
	}

	#[tokio::test]
	async fn over_budget_root_route_fails_with_a_fee_hint() {
		let rpc = Arc::new(diamond_rpc());
		let diversity = engine(&rpc);
		let mut payment = payment_to(node_id(3));
		// Even the cheapest route's fee (1000 + 10ppm, twice) blows this budget.
		payment.fee_budget_msat = 10;

		match diversity.get_route(&mut payment).await {
			Err(RouteError::FeeBudgetExceeded { fee_msat, budget_msat }) => {
				assert!(fee_msat > budget_msat);
			},
			other => panic!("expected FeeBudgetExceeded, got {:?}", other.map(|r| r.hops.len())),
		}
		// The engine hinted at the worst hop for the caller's next attempt.
		assert_eq!(payment.excludes.len(), 1);
		match &payment.excludes[0] {
			RouteExclude::Channel(_) => {},
			other => panic!("expected a channel hint, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn cltv_budget_violation_hints_at_the_longest_delay() {
		let rpc = Arc::new(diamond_rpc());
		let diversity = engine(&rpc);
		let mut payment = payment_to(node_id(3));
		payment.cltv_budget = 1;

		match diversity.get_route(&mut payment).await {
			Err(RouteError::CltvBudgetExceeded { delay, budget }) => {
				assert!(delay > budget);
			},
			other => panic!("expected CltvBudgetExceeded, got {:?}", other.map(|r| r.hops.len())),
		}
		assert_eq!(payment.excludes.len(), 1);
	}

	#[tokio::test]
	async fn tree_restart_clears_the_route_cache() {
		let rpc = Arc::new(diamond_rpc());
		let diversity = engine(&rpc);
		let mut payment = payment_to(node_id(3));

		// Walk until the queue state forces a restart: with a budget that only the shortest
		// route satisfies, the second request must re-emit the shortest route rather than
		// fail on the cached copy.
		let first = diversity.get_route(&mut payment).await.unwrap();
		payment.fee_budget_msat = first.fee_msat(payment.amount_msat).unwrap();
		let second = diversity.get_route(&mut payment).await.unwrap();
		assert_eq!(second.node_sequence(), first.node_sequence());
	}

	#[tokio::test]
	async fn same_destination_requests_are_serialised() {
		let rpc = Arc::new(diamond_rpc());
		let diversity = Arc::new(engine(&rpc));
		let mut payment_a = payment_to(node_id(3));
		let mut payment_b = payment_to(node_id(3));

		let (route_a, route_b) = tokio::join!(
			diversity.get_route(&mut payment_a),
			diversity.get_route(&mut payment_b),
		);
		// Had both run against the empty queue they would have returned the same shortest
		// route; serialisation means the second sees the first's seeded tree.
		assert_ne!(route_a.unwrap().node_sequence(), route_b.unwrap().node_sequence());

		// And with every request done, the destination state has been released.
		assert!(diversity.destinations.lock().unwrap().is_empty());
	}
}
