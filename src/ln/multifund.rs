// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Opens channels to many peers with a single funding transaction.
//!
//! The pipeline: connect to every peer (collecting feature bits), prepare a *dry-run*
//! transaction paying placeholder scripts (which reserves UTXOs, proves affordability and
//! resolves any "all" amount before peers are bothered), propose the open to every peer in
//! parallel, rebuild the transaction against the real funding scripts, collect every peer's
//! commitment signature in parallel, and only then broadcast.
//!
//! Two failure-handling rules shape the code. First, a failure of one peer's step must not
//! interrupt its siblings mid-flight: the node serialises `fundchannel_complete` ahead of
//! `fundchannel_cancel`, so cancelling while a sibling's complete is pending can lose the
//! race and leave that peer expecting a channel. Every parallel stage therefore runs all its
//! sparks to completion before surfacing the first failure. Second, broadcast failure is
//! ambiguous - the transaction may already sit in somebody's mempool - so every destination
//! is marked done *before* broadcast and is never cancelled afterwards; the caller sees the
//! error but the channels are treated as funded.
//!
//! Cleanup (discarding a reserved transaction, cancelling proposed-but-incomplete opens)
//! runs exactly once, on the exit path, before any result - success or error - is returned.

use crate::ln::connect::multi_connect;
use crate::rpc::{
	feature_offered, FundChannelStart, FundingStart, LightningRpc, OutputAmount, RpcError,
	TxOutputSpec, TxPrepareRequest, TxTarget, Utxo, FUND_MAX_EXCEEDED, FUND_OUTPUT_IS_DUST,
	FUND_TX_BROADCAST_FAIL, JSONRPC2_INTERNAL_ERROR, OPT_LARGE_CHANNELS,
};
use crate::routing::gossip::NodeId;
use crate::util::config::ChainParams;
use crate::util::logger::Logger;
use crate::util::spark::{start_spark, wait_all_sparks};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{ScriptBuf, Transaction, Txid};

use core::ops::Deref;

/// How far a destination's channel open has progressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FundDestinationState {
	/// `fundchannel_start` has not been attempted yet.
	NotStarted,
	/// The peer accepted `fundchannel_start`; it must be cancelled if we give up.
	Started,
	/// The peer rejected `fundchannel_start`; nothing to clean up.
	StartFailed,
	/// The peer accepted the proposal but `fundchannel_complete` failed; the open must
	/// still be cancelled.
	CompleteFailed,
	/// The funding transaction may have been broadcast; the open must never be cancelled.
	Done,
}

/// One requested channel open, as given by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundDestinationSpec {
	/// The peer, as `id[@host[:port]]`.
	pub id: String,
	/// The channel value.
	pub amount: OutputAmount,
	/// Whether to announce the channel. Defaults to announcing.
	pub announce: bool,
	/// How much of the channel value to give to the peer, in millisatoshis.
	pub push_msat: u64,
}

#[derive(Debug)]
struct FundDestination {
	/// The raw id string as given, possibly carrying an address part.
	id: String,
	/// The canonical peer id, known once connected.
	peer_id: Option<NodeId>,
	their_features: Vec<u8>,
	state: FundDestinationState,
	/// Set while the dry-run transaction stands in for the real one.
	placeholder_script: Option<ScriptBuf>,
	funding_script: Option<ScriptBuf>,
	/// True until the "all" amount is resolved by the dry run.
	all: bool,
	amount_sat: u64,
	announce: bool,
	push_msat: u64,
	/// This destination's output index in the funding transaction.
	outnum: Option<u32>,
	channel_id: Option<String>,
	error: Option<RpcError>,
}

/// The outcome of a successful [`MultiFundChannel::execute`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultiFundResult {
	/// The broadcast funding transaction.
	pub tx: Transaction,
	/// Its txid.
	pub txid: Txid,
	/// One channel id per destination, in input order.
	pub channel_ids: Vec<String>,
}

/// A single multi-destination funding command.
///
/// Create one per request and drive it with [`MultiFundChannel::execute`]; the command owns
/// its destinations and guarantees cleanup runs before the result is handed back.
#[derive(Debug)]
pub struct MultiFundChannel<R: Deref, L: Deref>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	rpc: R,
	logger: L,
	chainparams: ChainParams,
	destinations: Vec<FundDestination>,
	feerate: Option<String>,
	minconf: u32,
	utxos: Option<Vec<Utxo>>,
	/// The currently-reserved transaction, dry-run or final. Holding `Some` here obliges
	/// cleanup to discard it.
	txid: Option<Txid>,
	cleanup_done: bool,
}

impl<R: Deref, L: Deref> MultiFundChannel<R, L>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	/// Validates the request shape and creates the command.
	///
	/// `minconf` bounds how deep selected UTXOs must be buried (default 1); `utxos` pins
	/// the exact inputs instead.
	pub fn new(
		rpc: R, logger: L, chainparams: ChainParams, destinations: Vec<FundDestinationSpec>,
		feerate: Option<String>, minconf: Option<u32>, utxos: Option<Vec<Utxo>>,
	) -> Result<Self, RpcError> {
		if destinations.is_empty() {
			return Err(RpcError::invalid_params(
				"'destinations' must have at least one entry.",
			));
		}
		let all_count =
			destinations.iter().filter(|dest| dest.amount == OutputAmount::All).count();
		if all_count > 1 {
			return Err(RpcError::invalid_params(
				"Only one destination can indicate \"all\" for 'amount'.",
			));
		}

		let destinations = destinations
			.into_iter()
			.map(|spec| FundDestination {
				id: spec.id,
				peer_id: None,
				their_features: Vec::new(),
				state: FundDestinationState::NotStarted,
				placeholder_script: None,
				funding_script: None,
				all: spec.amount == OutputAmount::All,
				amount_sat: match spec.amount {
					OutputAmount::Sats(sats) => sats,
					OutputAmount::All => 0,
				},
				announce: spec.announce,
				push_msat: spec.push_msat,
				outnum: None,
				channel_id: None,
				error: None,
			})
			.collect();

		Ok(MultiFundChannel {
			rpc,
			logger,
			chainparams,
			destinations,
			feerate,
			minconf: minconf.unwrap_or(1),
			utxos,
			txid: None,
			cleanup_done: false,
		})
	}

	/// Runs the funding pipeline to completion.
	///
	/// On success exactly one transaction has been broadcast and every destination carries
	/// a channel id. On error, every proposed-but-unbroadcast open has been cancelled and
	/// any reserved transaction discarded; the first failure encountered is returned.
	pub async fn execute(mut self) -> Result<MultiFundResult, RpcError> {
		let result = self.run().await;
		self.cleanup().await;
		match &result {
			Ok(_) => log_debug!(self.logger, "multifundchannel: cleanup done, succeeding"),
			Err(err) => log_debug!(self.logger, "multifundchannel: cleanup done, failing: {}", err),
		}
		result
	}

	async fn run(&mut self) -> Result<MultiFundResult, RpcError> {
		self.connect().await?;
		self.validate_amounts()?;
		self.dryrun_prepare().await?;
		self.fund_starts().await?;
		self.reprepare().await?;
		self.fund_completes().await?;
		self.broadcast().await
	}

	/// Connecting up front is a convenience to us and the user both: it resolves address
	/// parts, fetches feature bits, and re-establishes connections some implementations
	/// drop after a failed funding attempt.
	async fn connect(&mut self) -> Result<(), RpcError> {
		let ids: Vec<String> = self.destinations.iter().map(|dest| dest.id.clone()).collect();
		let connections = multi_connect(&self.rpc, &self.logger, &ids).await?;
		for (dest, connection) in self.destinations.iter_mut().zip(connections) {
			dest.peer_id = Some(connection.id);
			dest.their_features = connection.features;
		}

		// Canonical ids in hand, duplicates are now detectable regardless of differing
		// address decorations.
		for i in 0..self.destinations.len() {
			for j in i + 1..self.destinations.len() {
				if self.destinations[i].peer_id == self.destinations[j].peer_id {
					return Err(RpcError::invalid_params(format!(
						"Duplicate destination: {}",
						self.destinations[i].id
					)));
				}
			}
		}
		Ok(())
	}

	fn validate_amounts(&self) -> Result<(), RpcError> {
		for dest in self.destinations.iter() {
			if dest.all {
				continue;
			}
			if dest.amount_sat < self.chainparams.dust_limit_sats {
				return Err(RpcError::new(
					FUND_OUTPUT_IS_DUST,
					format!("Amount for {} would be dust: {}sat", dest.id, dest.amount_sat),
				));
			}
			if dest.amount_sat > self.chainparams.max_funding_sats
				&& !feature_offered(&dest.their_features, OPT_LARGE_CHANNELS)
			{
				return Err(RpcError::new(
					FUND_MAX_EXCEEDED,
					format!(
						"Amount for {} exceeds maximum channel size: {}sat > {}sat",
						dest.id, dest.amount_sat, self.chainparams.max_funding_sats
					),
				));
			}
		}
		Ok(())
	}

	/// A placeholder scriptPubKey for the dry run, derived from the destination id. Not a
	/// spendable script - the dry-run transaction is never broadcast - merely a unique
	/// marker to find the destination's output again.
	fn placeholder_script(id: &str) -> ScriptBuf {
		let hash = sha256::Hash::hash(id.as_bytes());
		let mut script = Vec::with_capacity(34);
		script.push(0x00); // SegWit version.
		script.push(0x20); // PUSHDATA 32.
		script.extend_from_slice(hash.as_byte_array());
		ScriptBuf::from_bytes(script)
	}

	/// The dry-run `txprepare`: delegates "all" handling to the wallet, proves the funds
	/// exist, and keeps them reserved while the (possibly slow) peer negotiation runs.
	async fn dryrun_prepare(&mut self) -> Result<(), RpcError> {
		log_debug!(self.logger, "multifundchannel: dry-run txprepare");

		for dest in self.destinations.iter_mut() {
			dest.placeholder_script = Some(Self::placeholder_script(&dest.id));
		}
		let request = TxPrepareRequest {
			outputs: self
				.destinations
				.iter()
				.map(|dest| TxOutputSpec {
					target: TxTarget::Script(dest.placeholder_script.clone().unwrap_or_default()),
					amount: if dest.all {
						OutputAmount::All
					} else {
						OutputAmount::Sats(dest.amount_sat)
					},
				})
				.collect(),
			feerate: self.feerate.clone(),
			minconf: Some(self.minconf),
			utxos: self.utxos.clone(),
		};
		let prepared = self.rpc.tx_prepare(&request).await?;
		self.txid = Some(prepared.txid);

		// Read each destination's concrete amount back out of the transaction; this is
		// where "all" becomes a number.
		for dest in self.destinations.iter_mut() {
			let output = prepared
				.unsigned_tx
				.output
				.iter()
				.find(|output| Some(&output.script_pubkey) == dest.placeholder_script.as_ref());
			let output = output.ok_or_else(|| {
				RpcError::new(
					JSONRPC2_INTERNAL_ERROR,
					format!("txprepare transaction has no output for destination {}", dest.id),
				)
			})?;
			dest.amount_sat = output.value.to_sat();
			if dest.all
				&& !feature_offered(&dest.their_features, OPT_LARGE_CHANNELS)
				&& dest.amount_sat > self.chainparams.max_funding_sats
			{
				dest.amount_sat = self.chainparams.max_funding_sats;
			}
			dest.all = false;
		}
		Ok(())
	}

	/// Proposes the open to every peer in parallel. Peers answer at their own pace and
	/// faster peers may time out on us if we dawdle, so the proposals must overlap.
	async fn fund_starts(&mut self) -> Result<(), RpcError> {
		log_debug!(self.logger, "multifundchannel: fundchannel_start sparks");

		let backend = &*self.rpc;
		let sparks = self
			.destinations
			.iter()
			.map(|dest| {
				let request = FundChannelStart {
					id: dest.peer_id.unwrap_or(NodeId::from_bytes([0; 33])),
					amount_sat: dest.amount_sat,
					feerate: self.feerate.clone(),
					announce: dest.announce,
					push_msat: dest.push_msat,
				};
				start_spark(async move { backend.fund_channel_start(&request).await })
			})
			.collect();
		let results: Vec<Result<FundingStart, RpcError>> = wait_all_sparks(sparks).await;

		for (dest, result) in self.destinations.iter_mut().zip(results) {
			match result {
				Ok(start) => {
					dest.state = FundDestinationState::Started;
					dest.funding_script = Some(start.script_pubkey);
				},
				Err(err) => {
					dest.state = FundDestinationState::StartFailed;
					dest.error = Some(err);
				},
			}
		}

		// Only now that every spark has settled is it safe to surface a failure; see the
		// module docs for why aborting mid-stage is not.
		for dest in self.destinations.iter() {
			debug_assert!(
				dest.state == FundDestinationState::Started
					|| dest.state == FundDestinationState::StartFailed
			);
			if let Some(err) = &dest.error {
				log_debug!(self.logger, "multifundchannel: fundchannel_start {} failed: {}",
					dest.id, err);
				return Err(err.clone());
			}
		}
		Ok(())
	}

	/// Replaces the dry-run transaction with one paying the real funding scripts. Done as
	/// discard-plus-prepare; the wallet briefly unreserves the inputs in between, which is
	/// a known race we accept until the wallet grows an atomic modify operation.
	async fn reprepare(&mut self) -> Result<(), RpcError> {
		log_debug!(self.logger, "multifundchannel: replacing dry-run transaction");

		if let Some(txid) = self.txid.take() {
			self.rpc.tx_discard(&txid).await?;
		}
		let request = TxPrepareRequest {
			outputs: self
				.destinations
				.iter()
				.map(|dest| TxOutputSpec {
					target: TxTarget::Script(dest.funding_script.clone().unwrap_or_default()),
					amount: OutputAmount::Sats(dest.amount_sat),
				})
				.collect(),
			feerate: self.feerate.clone(),
			minconf: Some(self.minconf),
			utxos: self.utxos.clone(),
		};
		let prepared = self.rpc.tx_prepare(&request).await?;
		self.txid = Some(prepared.txid);

		// The wallet orders outputs as it likes; match each destination to its output
		// index by scriptPubKey.
		for dest in self.destinations.iter_mut() {
			let outnum = prepared
				.unsigned_tx
				.output
				.iter()
				.position(|output| Some(&output.script_pubkey) == dest.funding_script.as_ref());
			match outnum {
				Some(outnum) => dest.outnum = Some(outnum as u32),
				None => {
					return Err(RpcError::new(
						JSONRPC2_INTERNAL_ERROR,
						format!("txprepare missing funding output for {}", dest.id),
					))
				},
			}
		}
		Ok(())
	}

	/// Collects every peer's commitment signature in parallel. Until a peer has signed our
	/// backout transaction we dare not broadcast; with it, the channel is safe to fund.
	async fn fund_completes(&mut self) -> Result<(), RpcError> {
		log_debug!(self.logger, "multifundchannel: fundchannel_complete sparks");

		let txid = match self.txid {
			Some(txid) => txid,
			None => {
				return Err(RpcError::new(
					JSONRPC2_INTERNAL_ERROR,
					"No prepared transaction to complete against",
				))
			},
		};
		let backend = &*self.rpc;
		let sparks = self
			.destinations
			.iter()
			.map(|dest| {
				let id = dest.peer_id.unwrap_or(NodeId::from_bytes([0; 33]));
				let outnum = dest.outnum.unwrap_or(0);
				start_spark(async move {
					backend.fund_channel_complete(&id, &txid, outnum).await
				})
			})
			.collect();
		let results = wait_all_sparks(sparks).await;

		for (dest, result) in self.destinations.iter_mut().zip(results) {
			match result {
				Ok(complete) => dest.channel_id = Some(complete.channel_id),
				Err(err) => {
					dest.state = FundDestinationState::CompleteFailed;
					dest.error = Some(err);
				},
			}
		}

		for dest in self.destinations.iter() {
			debug_assert!(
				dest.state == FundDestinationState::Started
					|| dest.state == FundDestinationState::CompleteFailed
			);
			if dest.state == FundDestinationState::CompleteFailed {
				if let Some(err) = &dest.error {
					log_debug!(self.logger,
						"multifundchannel: fundchannel_complete {} failed: {}", dest.id, err);
					return Err(err.clone());
				}
			}
		}
		Ok(())
	}

	async fn broadcast(&mut self) -> Result<MultiFundResult, RpcError> {
		log_debug!(self.logger, "multifundchannel: txsend");

		// Mark everything done *before* broadcasting: if txsend errors after the
		// transaction reached a mempool, cancelling opens would strand funded channels.
		// A broadcast failure is treated as a possible false negative.
		for dest in self.destinations.iter_mut() {
			dest.state = FundDestinationState::Done;
		}
		// Take the txid now: whether txsend succeeds or fails, there is nothing left for
		// cleanup to discard.
		let txid = match self.txid.take() {
			Some(txid) => txid,
			None => {
				return Err(RpcError::new(
					JSONRPC2_INTERNAL_ERROR,
					"No prepared transaction to broadcast",
				))
			},
		};

		let sent = match self.rpc.tx_send(&txid).await {
			Ok(sent) => sent,
			Err(err) => {
				log_warn!(self.logger,
					"txsend failed, but the transaction may still have been broadcast: {}", err);
				return Err(RpcError::new(
					FUND_TX_BROADCAST_FAIL,
					format!("Broadcast failed: {}", err),
				)
				.with_command("txsend"));
			},
		};

		let channel_ids = self
			.destinations
			.iter()
			.map(|dest| dest.channel_id.clone().unwrap_or_default())
			.collect();
		Ok(MultiFundResult { tx: sent.tx, txid: sent.txid, channel_ids })
	}

	/// Discards any reserved transaction and cancels every proposed-but-unbroadcast open,
	/// in parallel. Runs at most once per command; the pipeline calls it on every exit
	/// path before the result is surfaced.
	async fn cleanup(&mut self) {
		if self.cleanup_done {
			return;
		}
		self.cleanup_done = true;

		log_debug!(self.logger, "multifundchannel: cleanup");

		let reserved_txid = self.txid.take();
		// Only Started opens need cancelling: a failed start never registered with the
		// peer, a failed complete already tore the proposal down, and Done opens must
		// never be cancelled.
		let cancel_ids: Vec<NodeId> = self
			.destinations
			.iter()
			.filter(|dest| dest.state == FundDestinationState::Started)
			.filter_map(|dest| dest.peer_id)
			.collect();

		let backend = &*self.rpc;
		let mut sparks = Vec::new();
		if let Some(txid) = reserved_txid {
			sparks.push(start_spark(async move {
				// Cleanup is best-effort; a failed discard or cancel changes nothing we
				// can act on.
				let _ = backend.tx_discard(&txid).await;
			}));
		}
		for id in cancel_ids {
			sparks.push(start_spark(async move {
				let _ = backend.fund_channel_cancel(&id).await;
			}));
		}
		wait_all_sparks(sparks).await;
	}
}
