// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Test backends: a line-capturing logger and an in-memory node implementation scripted
//! from plain data, so every command in this crate can be exercised hermetically.

use crate::routing::gossip::NodeId;
use crate::routing::router::{add_fee, Route, RouteHop, RouteHopStyle};
use crate::rpc::{
	feature_offered, AccelerateEstimate, AccelerateStart, AsyncRpcResult, FundChannelStart,
	FundingComplete, FundingStart, GetInfo, HalfChannel, LightningRpc, ListedNode, OutputAmount,
	PeerConnection, PreparedTx, RouteExclude, RouteRequest, RpcError, SentTx, TxPrepareRequest,
	TxTarget, FUND_CANNOT_AFFORD, JSONRPC2_INTERNAL_ERROR, OPT_VAR_ONION,
	PAY_ROUTE_NOT_FOUND, TXACCELERATE_ID_NOT_FOUND,
};
use crate::util::logger::{Level, Logger, Record};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Txid};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// A logger which captures every line for later assertions and echoes them to stdout (which
/// `cargo test` shows on failure).
#[derive(Debug)]
pub struct TestLogger {
	level: Level,
	/// Captured `(module_path, message)` pairs, in order.
	pub lines: Mutex<Vec<(String, String)>>,
}

impl TestLogger {
	/// A logger capturing everything.
	pub fn new() -> TestLogger {
		TestLogger { level: Level::Gossip, lines: Mutex::new(Vec::new()) }
	}

	/// Asserts that exactly `count` captured lines from `module` contain `line`.
	pub fn assert_log_contains(&self, module: &str, line: &str, count: usize) {
		let lines = self.lines.lock().unwrap();
		let found = lines
			.iter()
			.filter(|(log_module, message)| log_module == module && message.contains(line))
			.count();
		assert_eq!(found, count, "captured lines: {:?}", *lines);
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		if record.level < self.level {
			return;
		}
		let message = format!("{}", record.args);
		println!("{:<5} [{}:{}] {}", record.level, record.module_path, record.line, message);
		self.lines.lock().unwrap().push((record.module_path.to_string(), message));
	}
}

/// A deterministic test node id: compressed-key-shaped, ordered by `index`.
pub fn node_id(index: u8) -> NodeId {
	let mut bytes = [0u8; 33];
	bytes[0] = 2;
	bytes[32] = index;
	NodeId::from_bytes(bytes)
}

/// A half-channel with the given forwarding parameters and wide-open HTLC limits.
pub fn half_channel(
	source: NodeId, destination: NodeId, short_channel_id: u64, base_fee_msat: u64,
	fee_per_millionth: u32, delay: u32,
) -> HalfChannel {
	HalfChannel {
		source,
		destination,
		short_channel_id,
		direction: if source < destination { 0 } else { 1 },
		active: true,
		base_fee_msat,
		fee_per_millionth,
		delay,
		htlc_minimum_msat: 0,
		htlc_maximum_msat: 1_000_000_000_000_000,
	}
}

/// Both directions of a channel with symmetric parameters.
pub fn channel_pair(
	a: NodeId, b: NodeId, short_channel_id: u64, base_fee_msat: u64, fee_per_millionth: u32,
	delay: u32,
) -> Vec<HalfChannel> {
	vec![
		half_channel(a, b, short_channel_id, base_fee_msat, fee_per_millionth, delay),
		half_channel(b, a, short_channel_id, base_fee_msat, fee_per_millionth, delay),
	]
}

/// The mutable world a [`TestRpc`] serves from. Tests poke it directly through
/// [`TestRpc::state`].
#[derive(Debug)]
pub struct TestRpcState {
	/// The local node's id.
	pub local_id: NodeId,
	/// The current block height.
	pub blockheight: u32,
	/// Every known half-channel; list both directions for bidirectional channels.
	pub channels: Vec<HalfChannel>,
	/// Feature bits per node, for `listnodes`.
	pub node_features: HashMap<NodeId, Vec<u8>>,
	/// Nodes `listnodes` should claim to have forgotten.
	pub nodes_absent: HashSet<NodeId>,
	/// Connectable peers: raw id string to (canonical id, features).
	pub peers: HashMap<String, (NodeId, Vec<u8>)>,
	/// Spendable wallet balance, in satoshis.
	pub wallet_sats: u64,
	/// The flat fee `txprepare` charges, in satoshis.
	pub tx_fee_sats: u64,
	/// Txids with an active input reservation.
	pub reserved: HashSet<Txid>,
	/// Prepared transactions by txid.
	pub prepared: HashMap<Txid, Transaction>,
	/// Makes prepared txids unique.
	pub next_txid_byte: u8,
	/// Makes `txsend` fail when set.
	pub txsend_fail: bool,
	/// Every `fundchannel_start` request received.
	pub fundchannel_starts: Vec<FundChannelStart>,
	/// Peers whose `fundchannel_start` should fail.
	pub fundchannel_start_fail: HashSet<NodeId>,
	/// Peers whose `fundchannel_complete` should fail.
	pub fundchannel_complete_fail: HashSet<NodeId>,
	/// The estimate returned by `txaccelerate_start`.
	pub accel_start_estimate: AccelerateEstimate,
	/// Scripted `txaccelerate_estimate` responses; exhausted means the id is gone.
	pub accel_estimates: VecDeque<Result<AccelerateEstimate, RpcError>>,
	/// Scripted `txaccelerate_execute` responses; exhausted means the id is gone.
	pub accel_execute_results: VecDeque<Result<(), RpcError>>,
	/// Every fee passed to `txaccelerate_execute`, in order.
	pub accel_executed_fees: Vec<u64>,
	/// Every operation performed, as `"name args"` strings, in order.
	pub calls: Vec<String>,
	/// Every `getroute` request received.
	pub route_requests: Vec<RouteRequest>,
}

/// An in-memory [`LightningRpc`]: `getroute` really searches [`TestRpcState::channels`],
/// the wallet really tracks a balance and reservations, and everything records its calls.
#[derive(Debug)]
pub struct TestRpc {
	/// The scripted world. Lock it to inspect calls or reshape the network mid-test.
	pub state: Mutex<TestRpcState>,
}

impl TestRpc {
	/// Creates a backend whose `getinfo` reports the given local id.
	pub fn new(local_id: NodeId) -> Self {
		TestRpc {
			state: Mutex::new(TestRpcState {
				local_id,
				blockheight: 100,
				channels: Vec::new(),
				node_features: HashMap::new(),
				nodes_absent: HashSet::new(),
				peers: HashMap::new(),
				wallet_sats: 0,
				tx_fee_sats: 0,
				reserved: HashSet::new(),
				prepared: HashMap::new(),
				next_txid_byte: 1,
				txsend_fail: false,
				fundchannel_starts: Vec::new(),
				fundchannel_start_fail: HashSet::new(),
				fundchannel_complete_fail: HashSet::new(),
				accel_start_estimate: AccelerateEstimate {
					total_fee_sat: 0,
					delta_fee_sat: 0,
					max_fee_sat: 0,
				},
				accel_estimates: VecDeque::new(),
				accel_execute_results: VecDeque::new(),
				accel_executed_fees: Vec::new(),
				calls: Vec::new(),
				route_requests: Vec::new(),
			}),
		}
	}
}

/// Cheapest-fee search over the scripted channel table, honoring excludes and HTLC limits,
/// with amounts and delays accumulated the way `getroute` reports them.
fn compute_route(state: &TestRpcState, request: &RouteRequest) -> Result<Route, RpcError> {
	let excluded_channel = |channel: &HalfChannel| {
		request.excludes.iter().any(|exclude| match exclude {
			RouteExclude::Channel(chan) => {
				chan.scid == channel.short_channel_id && chan.direction == channel.direction
			},
			RouteExclude::Node(_) => false,
		})
	};
	let excluded_node = |node: &NodeId| {
		request.excludes.iter().any(|exclude| match exclude {
			RouteExclude::Node(id) => id == node,
			RouteExclude::Channel(_) => false,
		})
	};

	let usable = |channel: &HalfChannel| {
		request.amount_msat >= channel.htlc_minimum_msat
			&& request.amount_msat <= channel.htlc_maximum_msat
			&& !excluded_channel(channel)
			&& !excluded_node(&channel.destination)
	};

	// Plain Dijkstra on the fee of carrying the delivered amount; fine at test scale.
	let mut best: HashMap<NodeId, (u64, Option<usize>)> = HashMap::new();
	let mut done: HashSet<NodeId> = HashSet::new();
	best.insert(state.local_id, (0, None));
	loop {
		let current = best
			.iter()
			.filter(|(node, _)| !done.contains(*node))
			.min_by_key(|(_, (cost, _))| *cost)
			.map(|(node, (cost, _))| (*node, *cost));
		let (node, cost) = match current {
			Some(entry) => entry,
			None => break,
		};
		done.insert(node);
		if node == request.destination {
			break;
		}
		for (index, channel) in state.channels.iter().enumerate() {
			if channel.source != node || !usable(channel) {
				continue;
			}
			let fee = channel.base_fee_msat
				+ request.amount_msat * channel.fee_per_millionth as u64 / 1_000_000;
			let next_cost = cost + fee;
			let better = best
				.get(&channel.destination)
				.map_or(true, |(known, _)| next_cost < *known);
			if better {
				best.insert(channel.destination, (next_cost, Some(index)));
			}
		}
	}

	// Walk the predecessor links back from the destination.
	let mut path: Vec<&HalfChannel> = Vec::new();
	let mut cursor = request.destination;
	while cursor != state.local_id {
		let (_, via) = best
			.get(&cursor)
			.ok_or_else(|| RpcError::new(PAY_ROUTE_NOT_FOUND, "Could not find a route"))?;
		let channel = &state.channels[via
			.ok_or_else(|| RpcError::new(PAY_ROUTE_NOT_FOUND, "Could not find a route"))?];
		path.push(channel);
		cursor = channel.source;
	}
	path.reverse();
	if path.len() as u32 > request.max_hops {
		return Err(RpcError::new(PAY_ROUTE_NOT_FOUND, "Route too long"));
	}

	let mut hops = vec![None; path.len()];
	let mut amount_msat = request.amount_msat;
	let mut delay = request.final_cltv;
	for (index, channel) in path.iter().enumerate().rev() {
		let style = match state.node_features.get(&channel.destination) {
			Some(features) if !feature_offered(features, OPT_VAR_ONION) => RouteHopStyle::Legacy,
			_ => RouteHopStyle::Tlv,
		};
		hops[index] = Some(RouteHop {
			node_id: channel.destination,
			short_channel_id: channel.short_channel_id,
			direction: channel.direction,
			amount_msat,
			delay,
			style,
		});
		// The hop before this one must additionally supply this channel's fee and delay.
		amount_msat = add_fee(amount_msat, channel.base_fee_msat, channel.fee_per_millionth)
			.ok_or_else(|| RpcError::new(JSONRPC2_INTERNAL_ERROR, "fee overflow"))?;
		delay += channel.delay;
	}
	Ok(Route { hops: hops.into_iter().map(|hop| hop.unwrap()).collect() })
}

fn build_tx_output(target: &TxTarget, value_sat: u64) -> TxOut {
	let script_pubkey = match target {
		TxTarget::Script(script) => script.clone(),
		TxTarget::Address(address) => {
			// Addresses are opaque here; derive a unique stand-in script.
			let hash = sha256::Hash::hash(address.as_bytes());
			let mut script = Vec::with_capacity(34);
			script.push(0x00);
			script.push(0x20);
			script.extend_from_slice(hash.as_byte_array());
			ScriptBuf::from_bytes(script)
		},
	};
	TxOut { value: Amount::from_sat(value_sat), script_pubkey }
}

fn prepare_tx(state: &mut TestRpcState, request: &TxPrepareRequest) -> Result<PreparedTx, RpcError> {
	let mut exact_total_sat = 0u64;
	let mut all_count = 0usize;
	for output in request.outputs.iter() {
		match output.amount {
			OutputAmount::Sats(sats) => exact_total_sat += sats,
			OutputAmount::All => all_count += 1,
		}
	}
	if all_count > 1 {
		return Err(RpcError::invalid_params("Only one output may be \"all\""));
	}
	let fee = state.tx_fee_sats;
	if exact_total_sat + fee + (all_count as u64) > state.wallet_sats {
		return Err(RpcError::new(FUND_CANNOT_AFFORD, "Cannot afford transaction"));
	}
	let remainder_sat = state.wallet_sats - exact_total_sat - fee;

	let output = request
		.outputs
		.iter()
		.map(|spec| {
			let value_sat = match spec.amount {
				OutputAmount::Sats(sats) => sats,
				OutputAmount::All => remainder_sat,
			};
			build_tx_output(&spec.target, value_sat)
		})
		.collect();
	let tx = Transaction {
		version: bitcoin::transaction::Version::TWO,
		lock_time: bitcoin::absolute::LockTime::ZERO,
		input: Vec::new(),
		output,
	};
	let txid = Txid::from_byte_array([state.next_txid_byte; 32]);
	state.next_txid_byte += 1;
	state.reserved.insert(txid);
	state.prepared.insert(txid, tx.clone());
	Ok(PreparedTx { txid, unsigned_tx: tx })
}

impl LightningRpc for TestRpc {
	fn get_info(&self) -> AsyncRpcResult<'_, GetInfo> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push("getinfo".to_string());
			Ok(GetInfo { id: state.local_id, blockheight: state.blockheight })
		};
		Box::pin(async move { result })
	}

	fn list_channels_from<'a>(
		&'a self, source: &'a NodeId,
	) -> AsyncRpcResult<'a, Vec<HalfChannel>> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("listchannels source={}", source));
			Ok(state
				.channels
				.iter()
				.filter(|channel| channel.source == *source)
				.cloned()
				.collect())
		};
		Box::pin(async move { result })
	}

	fn list_channels_to<'a>(
		&'a self, destination: &'a NodeId,
	) -> AsyncRpcResult<'a, Vec<HalfChannel>> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("listchannels destination={}", destination));
			Ok(state
				.channels
				.iter()
				.filter(|channel| channel.destination == *destination)
				.cloned()
				.collect())
		};
		Box::pin(async move { result })
	}

	fn list_node<'a>(&'a self, id: &'a NodeId) -> AsyncRpcResult<'a, Option<ListedNode>> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("listnodes {}", id));
			if state.nodes_absent.contains(id) {
				Ok(None)
			} else {
				let features = state.node_features.get(id).cloned().unwrap_or_default();
				Ok(Some(ListedNode { id: *id, features }))
			}
		};
		Box::pin(async move { result })
	}

	fn get_route<'a>(&'a self, request: &'a RouteRequest) -> AsyncRpcResult<'a, Route> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("getroute {}", request.destination));
			state.route_requests.push(request.clone());
			compute_route(&state, request)
		};
		Box::pin(async move { result })
	}

	fn connect_peer<'a>(&'a self, id: &'a str) -> AsyncRpcResult<'a, PeerConnection> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("connect {}", id));
			match state.peers.get(id) {
				Some((node, features)) => {
					Ok(PeerConnection { id: *node, features: features.clone() })
				},
				None => Err(RpcError::new(
					JSONRPC2_INTERNAL_ERROR,
					format!("Unable to connect to {}", id),
				)),
			}
		};
		Box::pin(async move { result })
	}

	fn fund_channel_start<'a>(
		&'a self, request: &'a FundChannelStart,
	) -> AsyncRpcResult<'a, FundingStart> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("fundchannel_start {}", request.id));
			state.fundchannel_starts.push(request.clone());
			if state.fundchannel_start_fail.contains(&request.id) {
				Err(RpcError::new(JSONRPC2_INTERNAL_ERROR, "Peer refused channel open"))
			} else {
				let hash = sha256::Hash::hash(request.id.as_slice());
				let mut script = Vec::with_capacity(22);
				script.push(0x00);
				script.push(0x14);
				script.extend_from_slice(&hash.as_byte_array()[..20]);
				Ok(FundingStart {
					funding_address: format!("bcrt1-{}", request.id),
					script_pubkey: ScriptBuf::from_bytes(script),
				})
			}
		};
		Box::pin(async move { result })
	}

	fn fund_channel_complete<'a>(
		&'a self, id: &'a NodeId, txid: &'a Txid, outnum: u32,
	) -> AsyncRpcResult<'a, FundingComplete> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("fundchannel_complete {} {} {}", id, txid, outnum));
			if state.fundchannel_complete_fail.contains(id) {
				Err(RpcError::new(JSONRPC2_INTERNAL_ERROR, "Peer disconnected"))
			} else {
				Ok(FundingComplete { channel_id: format!("{}:{}", id, outnum) })
			}
		};
		Box::pin(async move { result })
	}

	fn fund_channel_cancel<'a>(&'a self, id: &'a NodeId) -> AsyncRpcResult<'a, ()> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("fundchannel_cancel {}", id));
			Ok(())
		};
		Box::pin(async move { result })
	}

	fn tx_prepare<'a>(&'a self, request: &'a TxPrepareRequest) -> AsyncRpcResult<'a, PreparedTx> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push("txprepare".to_string());
			prepare_tx(&mut state, request)
		};
		Box::pin(async move { result })
	}

	fn tx_send<'a>(&'a self, txid: &'a Txid) -> AsyncRpcResult<'a, SentTx> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("txsend {}", txid));
			// Success or failure, the reservation ends here.
			state.reserved.remove(txid);
			if state.txsend_fail {
				Err(RpcError::new(JSONRPC2_INTERNAL_ERROR, "sendrawtransaction failed"))
			} else {
				match state.prepared.get(txid) {
					Some(tx) => Ok(SentTx { tx: tx.clone(), txid: *txid }),
					None => Err(RpcError::new(JSONRPC2_INTERNAL_ERROR, "Unknown txid")),
				}
			}
		};
		Box::pin(async move { result })
	}

	fn tx_discard<'a>(&'a self, txid: &'a Txid) -> AsyncRpcResult<'a, ()> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("txdiscard {}", txid));
			state.reserved.remove(txid);
			Ok(())
		};
		Box::pin(async move { result })
	}

	fn wait_block_height(&self, height: u32, _timeout_secs: u32) -> AsyncRpcResult<'_, ()> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("waitblockheight {}", height));
			Ok(())
		};
		Box::pin(async move { result })
	}

	fn accelerate_start<'a>(&'a self, txid: &'a Txid) -> AsyncRpcResult<'a, AccelerateStart> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("txaccelerate_start {}", txid));
			Ok(AccelerateStart {
				txacc_id: "txacc-1".to_string(),
				estimate: state.accel_start_estimate,
			})
		};
		Box::pin(async move { result })
	}

	fn accelerate_estimate<'a>(
		&'a self, txacc_id: &'a str,
	) -> AsyncRpcResult<'a, AccelerateEstimate> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("txaccelerate_estimate {}", txacc_id));
			match state.accel_estimates.pop_front() {
				Some(result) => result,
				None => Err(RpcError::new(TXACCELERATE_ID_NOT_FOUND, "txacc_id not found")),
			}
		};
		Box::pin(async move { result })
	}

	fn accelerate_execute<'a>(
		&'a self, txacc_id: &'a str, total_fee_sat: u64,
	) -> AsyncRpcResult<'a, ()> {
		let result = {
			let mut state = self.state.lock().unwrap();
			state.calls.push(format!("txaccelerate_execute {} {}", txacc_id, total_fee_sat));
			state.accel_executed_fees.push(total_fee_sat);
			match state.accel_execute_results.pop_front() {
				Some(result) => result,
				None => Err(RpcError::new(TXACCELERATE_ID_NOT_FOUND, "txacc_id not found")),
			}
		};
		Box::pin(async move { result })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_router_prefers_cheap_paths_and_honors_excludes() {
		let rpc = TestRpc::new(node_id(0));
		{
			let mut state = rpc.state.lock().unwrap();
			state.channels.extend(channel_pair(node_id(0), node_id(1), 1, 10, 0, 6));
			state.channels.extend(channel_pair(node_id(1), node_id(2), 2, 10, 0, 6));
			state.channels.extend(channel_pair(node_id(0), node_id(2), 3, 1_000, 0, 6));
		}
		let mut request = RouteRequest {
			destination: node_id(2),
			amount_msat: 5_000,
			final_cltv: 9,
			riskfactor: 10.0,
			max_hops: 20,
			excludes: Vec::new(),
		};

		let route = rpc.get_route(&request).await.unwrap();
		assert_eq!(route.node_sequence(), vec![node_id(1), node_id(2)]);
		// Final hop carries the delivered amount; the first additionally carries the
		// last channel's fee.
		assert_eq!(route.hops[1].amount_msat, 5_000);
		assert_eq!(route.hops[0].amount_msat, 5_010);
		assert_eq!(route.hops[1].delay, 9);
		assert_eq!(route.hops[0].delay, 15);

		// Excluding the cheap middle node forces the direct channel.
		request.excludes.push(RouteExclude::Node(node_id(1)));
		let route = rpc.get_route(&request).await.unwrap();
		assert_eq!(route.node_sequence(), vec![node_id(2)]);
	}

	#[tokio::test]
	async fn test_wallet_tracks_reservations() {
		let rpc = TestRpc::new(node_id(0));
		{
			let mut state = rpc.state.lock().unwrap();
			state.wallet_sats = 10_000;
			state.tx_fee_sats = 100;
		}
		let request = TxPrepareRequest {
			outputs: vec![crate::rpc::TxOutputSpec {
				target: TxTarget::Address("addr".to_string()),
				amount: OutputAmount::All,
			}],
			feerate: None,
			minconf: None,
			utxos: None,
		};
		let prepared = rpc.tx_prepare(&request).await.unwrap();
		assert_eq!(prepared.unsigned_tx.output[0].value.to_sat(), 9_900);
		assert!(rpc.state.lock().unwrap().reserved.contains(&prepared.txid));
		rpc.tx_discard(&prepared.txid).await.unwrap();
		assert!(rpc.state.lock().unwrap().reserved.is_empty());
	}
}
