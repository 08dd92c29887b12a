// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Withdraws wallet funds to several addresses in one transaction.

use crate::rpc::{
	LightningRpc, OutputAmount, RpcError, SentTx, TxOutputSpec, TxPrepareRequest, TxTarget, Utxo,
};
use crate::util::logger::Logger;

use core::ops::Deref;

/// One requested withdrawal output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawOutput {
	/// The address to pay.
	pub address: String,
	/// How much to pay it.
	pub amount: OutputAmount,
}

/// Builds, signs and broadcasts a transaction paying the given outputs from the wallet.
///
/// At most one output may carry [`OutputAmount::All`], which resolves to whatever the
/// wallet holds beyond the other outputs and the fee. Wallet errors (insufficient funds,
/// dust outputs) forward unchanged.
pub async fn multi_withdraw<R: Deref, L: Deref>(
	rpc: &R, logger: &L, outputs: &[WithdrawOutput], feerate: Option<String>,
	minconf: Option<u32>, utxos: Option<Vec<Utxo>>,
) -> Result<SentTx, RpcError>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	if outputs.is_empty() {
		return Err(RpcError::invalid_params("'outputs' should not be an empty array."));
	}
	let all_count = outputs.iter().filter(|output| output.amount == OutputAmount::All).count();
	if all_count > 1 {
		return Err(RpcError::invalid_params(
			"'outputs' should only have one entry with \"all\".",
		));
	}

	log_debug!(logger, "multiwithdraw: txprepare for {} outputs", outputs.len());

	let request = TxPrepareRequest {
		outputs: outputs
			.iter()
			.map(|output| TxOutputSpec {
				target: TxTarget::Address(output.address.clone()),
				amount: output.amount,
			})
			.collect(),
		feerate,
		minconf,
		utxos,
	};
	let prepared = rpc.tx_prepare(&request).await?;

	log_debug!(logger, "multiwithdraw: txsend {}", prepared.txid);

	// A failed send unreserves the inputs wallet-side; nothing to discard here.
	let sent = rpc.tx_send(&prepared.txid).await?;
	Ok(sent)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::{FUND_CANNOT_AFFORD, JSONRPC2_INVALID_PARAMS};
	use crate::util::test_utils::{node_id, TestLogger, TestRpc};

	use std::sync::Arc;

	fn output(address: &str, amount: OutputAmount) -> WithdrawOutput {
		WithdrawOutput { address: address.to_string(), amount }
	}

	#[tokio::test]
	async fn withdraws_to_several_outputs() {
		let rpc = Arc::new(TestRpc::new(node_id(0)));
		{
			let mut state = rpc.state.lock().unwrap();
			state.wallet_sats = 1_000_000;
			state.tx_fee_sats = 500;
		}
		let logger = Arc::new(TestLogger::new());

		let sent = multi_withdraw(
			&rpc,
			&logger,
			&[
				output("bcrt1qfirst", OutputAmount::Sats(200_000)),
				output("bcrt1qsecond", OutputAmount::All),
			],
			None,
			None,
			None,
		)
		.await
		.unwrap();

		let amounts: Vec<u64> = sent.tx.output.iter().map(|out| out.value.to_sat()).collect();
		assert!(amounts.contains(&200_000));
		assert!(amounts.contains(&799_500));

		let state = rpc.state.lock().unwrap();
		assert!(state.reserved.is_empty());
		assert_eq!(state.calls.iter().filter(|call| call.starts_with("txsend")).count(), 1);
	}

	#[tokio::test]
	async fn rejects_empty_and_double_all() {
		let rpc = Arc::new(TestRpc::new(node_id(0)));
		let logger = Arc::new(TestLogger::new());

		let err = multi_withdraw(&rpc, &logger, &[], None, None, None).await.unwrap_err();
		assert_eq!(err.code, JSONRPC2_INVALID_PARAMS);

		let err = multi_withdraw(
			&rpc,
			&logger,
			&[output("a", OutputAmount::All), output("b", OutputAmount::All)],
			None,
			None,
			None,
		)
		.await
		.unwrap_err();
		assert_eq!(err.code, JSONRPC2_INVALID_PARAMS);
	}

	#[tokio::test]
	async fn wallet_errors_forward_unchanged() {
		let rpc = Arc::new(TestRpc::new(node_id(0)));
		{
			rpc.state.lock().unwrap().wallet_sats = 100;
		}
		let logger = Arc::new(TestLogger::new());
		let err = multi_withdraw(
			&rpc,
			&logger,
			&[output("bcrt1qbig", OutputAmount::Sats(1_000_000))],
			None,
			None,
			None,
		)
		.await
		.unwrap_err();
		assert_eq!(err.code, FUND_CANNOT_AFFORD);
	}
}
