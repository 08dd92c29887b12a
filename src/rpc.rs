// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The interface to the rest of the node.
//!
//! Everything this crate cannot do by itself - gossip lookups, shortest-route queries, peer
//! connections, the on-chain wallet, transaction broadcast - is reached through the
//! [`LightningRpc`] trait. Implementations typically forward to the node's internal RPC; an
//! in-memory implementation in `util::test_utils` backs this crate's tests.
//!
//! All operations are asynchronous and may suspend the caller; per the crate's cooperative
//! scheduling model, these suspension points are the only places concurrent work interleaves.

use crate::routing::gossip::NodeId;
use crate::routing::router::Route;

use bitcoin::{ScriptBuf, Transaction, Txid};

use core::fmt;
use core::future::Future;
use core::pin::Pin;

/// Invalid or inconsistent parameters from the caller.
pub const JSONRPC2_INVALID_PARAMS: i32 = -32602;
/// Catch-all for internal inconsistencies.
pub const JSONRPC2_INTERNAL_ERROR: i32 = -1;
/// No usable route exists (or could be repaired) to the destination.
pub const PAY_ROUTE_NOT_FOUND: i32 = 205;
/// The cheapest available route exceeds the payment's fee or CLTV budget.
pub const PAY_ROUTE_TOO_EXPENSIVE: i32 = 206;
/// A channel open exceeds the maximum funding the peer will accept.
pub const FUND_MAX_EXCEEDED: i32 = 300;
/// The wallet cannot afford the requested outputs at the requested feerate.
pub const FUND_CANNOT_AFFORD: i32 = 301;
/// A requested output is below the dust limit.
pub const FUND_OUTPUT_IS_DUST: i32 = 302;
/// The funding transaction may or may not have reached the network.
pub const FUND_TX_BROADCAST_FAIL: i32 = 303;
/// The acceleration id is gone, meaning a descendant of the accelerated transaction confirmed.
pub const TXACCELERATE_ID_NOT_FOUND: i32 = 1100;
/// The acceleration backend cannot work within the caller's fee ceiling.
pub const TXACCELERATE_UNAFFORDABLE: i32 = 1101;

/// An error returned by a backend operation, or synthesized by this crate for its own
/// command surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
	/// The JSON-RPC-style error code.
	pub code: i32,
	/// A human-readable description of what went wrong.
	pub message: String,
	/// The sub-command which failed, where one operation issues several.
	pub command: Option<String>,
}

impl RpcError {
	/// Creates a new error with the given code and message.
	pub fn new(code: i32, message: impl Into<String>) -> Self {
		RpcError { code, message: message.into(), command: None }
	}

	/// Tags the error with the sub-command that produced it.
	pub fn with_command(mut self, command: impl Into<String>) -> Self {
		self.command = Some(command.into());
		self
	}

	/// Creates an invalid-params error.
	pub fn invalid_params(message: impl Into<String>) -> Self {
		Self::new(JSONRPC2_INVALID_PARAMS, message)
	}
}

impl fmt::Display for RpcError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match &self.command {
			Some(command) => write!(f, "{} (code {}, in {})", self.message, self.code, command),
			None => write!(f, "{} (code {})", self.message, self.code),
		}
	}
}

impl std::error::Error for RpcError {}

/// Result type for [`LightningRpc`] requests.
pub type RpcResult<T> = Result<T, RpcError>;

// TODO: Replace with RpcResult once `async` trait functions are supported. For details,
// see: https://areweasyncyet.rs.
/// Result type for asynchronous [`LightningRpc`] requests.
pub type AsyncRpcResult<'a, T> = Pin<Box<dyn Future<Output = RpcResult<T>> + Send + 'a>>;

/// A short channel id plus the direction of one of its two half-channels.
///
/// Direction 0 flows from the lexically-lesser node id to the greater, direction 1 the
/// reverse.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ShortChannelIdDir {
	/// The channel's short id.
	pub scid: u64,
	/// Which half-channel, 0 or 1.
	pub direction: u8,
}

impl fmt::Display for ShortChannelIdDir {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}/{}", self.scid, self.direction)
	}
}

/// An element a route must not traverse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteExclude {
	/// Ban a single half-channel.
	Channel(ShortChannelIdDir),
	/// Ban a node entirely.
	Node(NodeId),
}

/// One direction of a channel, as listed by the gossip store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HalfChannel {
	/// The node this half-channel forwards from.
	pub source: NodeId,
	/// The node this half-channel forwards to.
	pub destination: NodeId,
	/// The channel's short id.
	pub short_channel_id: u64,
	/// Which half of the channel this is, 0 or 1.
	pub direction: u8,
	/// Whether the direction is currently usable.
	pub active: bool,
	/// The flat fee charged for forwarding, in millisatoshis.
	pub base_fee_msat: u64,
	/// The proportional fee charged for forwarding, in parts-per-million.
	pub fee_per_millionth: u32,
	/// The CLTV delta this direction adds to the outgoing timelock, in blocks.
	pub delay: u32,
	/// The minimum HTLC value this direction will forward, in millisatoshis.
	pub htlc_minimum_msat: u64,
	/// The maximum HTLC value this direction will forward, in millisatoshis.
	pub htlc_maximum_msat: u64,
}

/// Basic information about the local node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetInfo {
	/// The local node's id.
	pub id: NodeId,
	/// The current best block height.
	pub blockheight: u32,
}

/// A node record from the gossip store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedNode {
	/// The node's id.
	pub id: NodeId,
	/// The node's announced feature bits, BOLT #9 encoding.
	pub features: Vec<u8>,
}

/// A shortest-route request.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteRequest {
	/// The node the payment must reach.
	pub destination: NodeId,
	/// The amount to deliver to the destination, in millisatoshis.
	pub amount_msat: u64,
	/// The CLTV delta the destination requires, in blocks.
	pub final_cltv: u32,
	/// How strongly to prefer short lockups over low fees, in percent per annum.
	pub riskfactor: f64,
	/// The longest acceptable route, in hops.
	pub max_hops: u32,
	/// Channels and nodes the route must avoid.
	pub excludes: Vec<RouteExclude>,
}

/// The result of connecting to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerConnection {
	/// The peer's canonical node id, with any address part resolved away.
	pub id: NodeId,
	/// The feature bits the peer advertised at init, BOLT #9 encoding.
	pub features: Vec<u8>,
}

/// Parameters for proposing a channel open to a connected peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundChannelStart {
	/// The peer to open to.
	pub id: NodeId,
	/// The channel value, in satoshis.
	pub amount_sat: u64,
	/// The feerate to quote for the funding transaction, if not the default.
	pub feerate: Option<String>,
	/// Whether the channel should be announced to the network.
	pub announce: bool,
	/// How much of the channel value to give away to the peer, in millisatoshis.
	pub push_msat: u64,
}

/// A peer's answer to a channel-open proposal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingStart {
	/// The address of the 2-of-2 funding output.
	pub funding_address: String,
	/// The scriptPubKey of the 2-of-2 funding output.
	pub script_pubkey: ScriptBuf,
}

/// The result of completing a channel open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingComplete {
	/// The id of the newly-created channel.
	pub channel_id: String,
}

/// An output amount, either exact or "whatever remains".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputAmount {
	/// An exact amount, in satoshis.
	Sats(u64),
	/// All remaining funds after other outputs and fees.
	All,
}

/// Where a prepared transaction output pays to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxTarget {
	/// An address, resolved to a scriptPubKey by the wallet.
	Address(String),
	/// A raw scriptPubKey.
	Script(ScriptBuf),
}

/// One output of a transaction to be prepared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutputSpec {
	/// Where the output pays to.
	pub target: TxTarget,
	/// How much the output pays.
	pub amount: OutputAmount,
}

/// A wallet UTXO reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Utxo {
	/// The funding transaction id.
	pub txid: Txid,
	/// The output index within that transaction.
	pub vout: u32,
}

/// Parameters for preparing (and reserving the inputs of) a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxPrepareRequest {
	/// The outputs to pay. At most one may be [`OutputAmount::All`].
	pub outputs: Vec<TxOutputSpec>,
	/// The feerate to use, if not the default.
	pub feerate: Option<String>,
	/// Only select inputs buried at least this many blocks deep.
	pub minconf: Option<u32>,
	/// Spend exactly these UTXOs rather than letting the wallet select.
	pub utxos: Option<Vec<Utxo>>,
}

/// A prepared-but-unbroadcast transaction whose inputs are now reserved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedTx {
	/// The transaction's id.
	pub txid: Txid,
	/// The unsigned transaction itself.
	pub unsigned_tx: Transaction,
}

/// A broadcast transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentTx {
	/// The fully-signed transaction.
	pub tx: Transaction,
	/// Its id.
	pub txid: Txid,
}

/// A fee estimate from the acceleration backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelerateEstimate {
	/// The total fee, in satoshis, the backend believes will confirm the transaction.
	pub total_fee_sat: u64,
	/// How much, in satoshis, the backend can raise the fee by right now.
	pub delta_fee_sat: u64,
	/// The largest total fee, in satoshis, the backend can reach at all.
	pub max_fee_sat: u64,
}

/// The result of starting an acceleration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccelerateStart {
	/// A handle for subsequent estimate/execute calls. Deleted by the backend once a
	/// descendant of the accelerated transaction confirms.
	pub txacc_id: String,
	/// The initial fee estimate.
	pub estimate: AccelerateEstimate,
}

/// The node operations this crate consumes.
///
/// One implementation per node backend; all methods return boxed futures so the trait stays
/// object-safe and usable on stable Rust.
pub trait LightningRpc: Send + Sync {
	/// Returns the local node id and current block height.
	fn get_info(&self) -> AsyncRpcResult<'_, GetInfo>;

	/// Lists every half-channel whose source is the given node.
	fn list_channels_from<'a>(&'a self, source: &'a NodeId) -> AsyncRpcResult<'a, Vec<HalfChannel>>;

	/// Lists every half-channel whose destination is the given node.
	fn list_channels_to<'a>(
		&'a self, destination: &'a NodeId,
	) -> AsyncRpcResult<'a, Vec<HalfChannel>>;

	/// Looks up a single node record, or `None` if gossip has forgotten it.
	fn list_node<'a>(&'a self, id: &'a NodeId) -> AsyncRpcResult<'a, Option<ListedNode>>;

	/// Computes a cheapest route satisfying the request, or errors with
	/// [`PAY_ROUTE_NOT_FOUND`].
	fn get_route<'a>(&'a self, request: &'a RouteRequest) -> AsyncRpcResult<'a, Route>;

	/// Connects to a peer given `id[@host[:port]]`, returning its canonical id and features.
	fn connect_peer<'a>(&'a self, id: &'a str) -> AsyncRpcResult<'a, PeerConnection>;

	/// Proposes a channel open to a connected peer.
	fn fund_channel_start<'a>(
		&'a self, request: &'a FundChannelStart,
	) -> AsyncRpcResult<'a, FundingStart>;

	/// Completes a proposed channel open against an output of a prepared transaction,
	/// obtaining the peer's commitment signature.
	fn fund_channel_complete<'a>(
		&'a self, id: &'a NodeId, txid: &'a Txid, outnum: u32,
	) -> AsyncRpcResult<'a, FundingComplete>;

	/// Abandons a proposed-but-incomplete channel open.
	fn fund_channel_cancel<'a>(&'a self, id: &'a NodeId) -> AsyncRpcResult<'a, ()>;

	/// Builds an unsigned transaction paying the given outputs and reserves its inputs.
	fn tx_prepare<'a>(&'a self, request: &'a TxPrepareRequest) -> AsyncRpcResult<'a, PreparedTx>;

	/// Signs and broadcasts a previously-prepared transaction.
	fn tx_send<'a>(&'a self, txid: &'a Txid) -> AsyncRpcResult<'a, SentTx>;

	/// Abandons a previously-prepared transaction, unreserving its inputs.
	fn tx_discard<'a>(&'a self, txid: &'a Txid) -> AsyncRpcResult<'a, ()>;

	/// Returns once the chain reaches the given height, or after `timeout_secs`, whichever
	/// comes first. Timing out is reported as an error but callers generally ignore it.
	fn wait_block_height(&self, height: u32, timeout_secs: u32) -> AsyncRpcResult<'_, ()>;

	/// Begins accelerating the given transaction, returning a handle and an initial
	/// estimate.
	fn accelerate_start<'a>(&'a self, txid: &'a Txid) -> AsyncRpcResult<'a, AccelerateStart>;

	/// Re-estimates fees for an in-progress acceleration.
	fn accelerate_estimate<'a>(
		&'a self, txacc_id: &'a str,
	) -> AsyncRpcResult<'a, AccelerateEstimate>;

	/// Replaces the pending acceleration with one paying the given total fee.
	fn accelerate_execute<'a>(
		&'a self, txacc_id: &'a str, total_fee_sat: u64,
	) -> AsyncRpcResult<'a, ()>;
}

/// Whether the given BOLT #9 feature bitfield offers feature `bit` (in either its compulsory
/// or optional form; `bit` is the even, compulsory number).
pub fn feature_offered(features: &[u8], bit: usize) -> bool {
	for feature_bit in [bit, bit + 1] {
		let byte = feature_bit / 8;
		if byte >= features.len() {
			continue;
		}
		// Feature bitfields are big-endian: bit 0 lives in the last byte.
		if features[features.len() - 1 - byte] & (1 << (feature_bit % 8)) != 0 {
			return true;
		}
	}
	false
}

/// The variable-length ("TLV") onion payload feature.
pub const OPT_VAR_ONION: usize = 8;
/// The large-channels ("wumbo") feature.
pub const OPT_LARGE_CHANNELS: usize = 18;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn feature_bits_are_big_endian() {
		// var_onion_optin (bit 9) set: byte 1 from the end, bit 1.
		assert!(feature_offered(&[0x02, 0x00], OPT_VAR_ONION));
		// Compulsory form (bit 8) also counts as offered.
		assert!(feature_offered(&[0x01, 0x00], OPT_VAR_ONION));
		assert!(!feature_offered(&[0x00, 0x00], OPT_VAR_ONION));
		// Too-short bitfields simply don't offer high bits.
		assert!(!feature_offered(&[0x01], OPT_LARGE_CHANNELS));
		// option_support_large_channel (bit 19): byte 2 from the end, bit 3.
		assert!(feature_offered(&[0x08, 0x00, 0x00], OPT_LARGE_CHANNELS));
	}

	#[test]
	fn rpc_error_display_includes_command() {
		let err = RpcError::new(PAY_ROUTE_NOT_FOUND, "no route").with_command("listchannels");
		assert_eq!(err.to_string(), "no route (code 205, in listchannels)");
		let err = RpcError::invalid_params("bad route");
		assert_eq!(err.to_string(), "bad route (code -32602)");
	}
}
