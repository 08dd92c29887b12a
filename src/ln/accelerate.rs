// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Drives the fee-acceleration backend until a version of a transaction confirms.
//!
//! The backend owns the mechanics of replacing or CPFP-ing the transaction; this loop owns
//! the policy: how far above the backend's estimate to bid (the *aggression*), when to wait
//! for the chain to move instead of bidding again, and when to give up because the caller's
//! fee ceiling cannot buy any acceleration at all.
//!
//! The loop terminates through an error, by design: once a descendant of the accelerated
//! transaction confirms, the backend deletes the acceleration handle, and the next execute
//! or estimate against it fails with [`TXACCELERATE_ID_NOT_FOUND`] - which is success.

use crate::rpc::{
	AccelerateEstimate, LightningRpc, RpcError, FUND_CANNOT_AFFORD, TXACCELERATE_ID_NOT_FOUND,
	TXACCELERATE_UNAFFORDABLE,
};
use crate::util::logger::Logger;

use bitcoin::Txid;

use core::ops::Deref;

/// The default aggression: bid 10% of the way from the estimate to the caller's ceiling.
pub const DEFAULT_AGGRESSION: f64 = 0.10;

/// How long each wait-for-a-block gate lasts at most, in seconds.
const WAIT_BLOCK_TIMEOUT_SECS: u32 = 60;

/// One decision taken by the acceleration loop, for the caller's post-mortem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccelerateLogEntry {
	/// The block height at the time.
	pub blockheight: u32,
	/// The backend's estimate when the decision was taken.
	pub estimate: AccelerateEstimate,
	/// What the loop decided.
	pub comment: String,
}

/// The outcome of a completed acceleration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccelerateOutcome {
	/// Whether any acceleration was actually executed. False means the transaction
	/// confirmed on its own before we could (or needed to) bid.
	pub accelerated: bool,
	/// The fee of the last executed acceleration, in satoshis, if any.
	pub final_fee_sat: Option<u64>,
	/// Every decision the loop took, in order.
	pub log: Vec<AccelerateLogEntry>,
}

/// A single acceleration command for one transaction.
pub struct TxAccelerator<R: Deref, L: Deref>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	rpc: R,
	logger: L,
	txid: Txid,
	max_acceptable_fee_sat: u64,
	aggression: f64,
}

enum Wait {
	/// A fresh estimate arrived; keep looping.
	Reestimated(AccelerateEstimate),
	/// The acceleration handle is gone: a descendant confirmed.
	Confirmed,
}

impl<R: Deref, L: Deref> TxAccelerator<R, L>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	/// Creates an accelerator spending at most `max_acceptable_fee_sat`, bidding
	/// `aggression` (default 10%) of the remaining headroom per attempt.
	pub fn new(
		rpc: R, logger: L, txid: Txid, max_acceptable_fee_sat: u64, aggression: Option<f64>,
	) -> Self {
		TxAccelerator {
			rpc,
			logger,
			txid,
			max_acceptable_fee_sat,
			aggression: aggression.unwrap_or(DEFAULT_AGGRESSION),
		}
	}

	/// Runs until a version of the transaction confirms, returning what was spent.
	pub async fn run(&self) -> Result<AccelerateOutcome, RpcError> {
		let mut blockheight = self.rpc.get_info().await?.blockheight;

		log_debug!(self.logger, "txaccelerate: starting acceleration of {}", self.txid);
		let start = self.rpc.accelerate_start(&self.txid).await?;
		let txacc_id = start.txacc_id;
		let mut estimate = start.estimate;

		let mut have_accelerated = false;
		let mut final_fee_sat = None;
		let mut log = Vec::new();

		loop {
			log_debug!(self.logger,
				"txaccelerate: estimates total {}sat delta {}sat max {}sat, limit {}sat",
				estimate.total_fee_sat, estimate.delta_fee_sat, estimate.max_fee_sat,
				self.max_acceptable_fee_sat);

			// Nothing the backend can do right now; maybe a block or a wallet change will
			// open headroom later.
			if estimate.delta_fee_sat == 0 && estimate.total_fee_sat == estimate.max_fee_sat {
				log.push(AccelerateLogEntry {
					blockheight,
					estimate,
					comment: "Cannot accelerate now, will sleep.".to_string(),
				});
				match self.wait_and_reestimate(&txacc_id, &mut blockheight).await? {
					Wait::Reestimated(next) => estimate = next,
					Wait::Confirmed => break,
				}
				continue;
			}

			// The backend's own estimate already exceeds what the caller will pay.
			if estimate.total_fee_sat > self.max_acceptable_fee_sat {
				if !have_accelerated {
					log_info!(self.logger,
						"txaccelerate: ceiling {}sat cannot buy any acceleration of {}",
						self.max_acceptable_fee_sat, self.txid);
					log.push(AccelerateLogEntry {
						blockheight,
						estimate,
						comment: format!(
							"Max acceptable {}sat too low for any acceleration, failing.",
							self.max_acceptable_fee_sat
						),
					});
					return Err(RpcError::new(
						TXACCELERATE_UNAFFORDABLE,
						format!(
							"Estimated fee {}sat exceeds max_acceptable_fee {}sat",
							estimate.total_fee_sat, self.max_acceptable_fee_sat
						),
					));
				}
				log.push(AccelerateLogEntry {
					blockheight,
					estimate,
					comment: format!(
						"Max acceptable {}sat reached, will sleep.",
						self.max_acceptable_fee_sat
					),
				});
				match self.wait_and_reestimate(&txacc_id, &mut blockheight).await? {
					Wait::Reestimated(next) => estimate = next,
					Wait::Confirmed => break,
				}
				continue;
			}

			// Bid `aggression` of the way from the estimate towards the ceiling, clamped
			// to what the backend can reach at all.
			let headroom = self.max_acceptable_fee_sat - estimate.total_fee_sat;
			let mut fee_sat =
				estimate.total_fee_sat + (headroom as f64 * self.aggression) as u64;
			if fee_sat > estimate.max_fee_sat {
				fee_sat = estimate.max_fee_sat;
			}

			log_debug!(self.logger, "txaccelerate: executing at {}sat", fee_sat);
			match self.rpc.accelerate_execute(&txacc_id, fee_sat).await {
				Ok(()) => {
					have_accelerated = true;
					final_fee_sat = Some(fee_sat);
					log.push(AccelerateLogEntry {
						blockheight,
						estimate,
						comment: format!("Executed acceleration at {}sat.", fee_sat),
					});
					match self.wait_and_reestimate(&txacc_id, &mut blockheight).await? {
						Wait::Reestimated(next) => estimate = next,
						Wait::Confirmed => break,
					}
				},
				// The handle is gone, meaning a version of the transaction confirmed:
				// that is exactly what we were working towards.
				Err(err) if err.code == TXACCELERATE_ID_NOT_FOUND => break,
				// Another wallet user spent coins the estimate counted on; re-estimate
				// right away rather than waiting for a block.
				Err(err) if err.code == FUND_CANNOT_AFFORD => {
					log.push(AccelerateLogEntry {
						blockheight,
						estimate,
						comment: "Wallet funds moved under us, re-estimating.".to_string(),
					});
					match self.reestimate(&txacc_id).await? {
						Wait::Reestimated(next) => estimate = next,
						Wait::Confirmed => break,
					}
				},
				Err(err) => return Err(err),
			}
		}

		log_debug!(self.logger, "txaccelerate: {} confirmed (accelerated: {})",
			self.txid, have_accelerated);
		Ok(AccelerateOutcome { accelerated: have_accelerated, final_fee_sat, log })
	}

	/// Gates on the next block (or a minute, whichever first), refreshes the block height,
	/// and re-estimates.
	async fn wait_and_reestimate(
		&self, txacc_id: &str, blockheight: &mut u32,
	) -> Result<Wait, RpcError> {
		// Timing out is fine; we re-check the world either way.
		let _ = self.rpc.wait_block_height(*blockheight + 1, WAIT_BLOCK_TIMEOUT_SECS).await;
		*blockheight = self.rpc.get_info().await?.blockheight;
		self.reestimate(txacc_id).await
	}

	async fn reestimate(&self, txacc_id: &str) -> Result<Wait, RpcError> {
		match self.rpc.accelerate_estimate(txacc_id).await {
			Ok(estimate) => Ok(Wait::Reestimated(estimate)),
			Err(err) if err.code == TXACCELERATE_ID_NOT_FOUND => Ok(Wait::Confirmed),
			Err(err) => Err(err),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::{node_id, TestLogger, TestRpc};

	use bitcoin::hashes::Hash;
	use std::sync::Arc;

	fn accelerator(
		rpc: &Arc<TestRpc>, max_fee_sat: u64, aggression: Option<f64>,
	) -> TxAccelerator<Arc<TestRpc>, Arc<TestLogger>> {
		TxAccelerator::new(
			Arc::clone(rpc),
			Arc::new(TestLogger::new()),
			Txid::from_byte_array([9; 32]),
			max_fee_sat,
			aggression,
		)
	}

	#[tokio::test]
	async fn bids_aggression_above_the_estimate() {
		let rpc = Arc::new(TestRpc::new(node_id(0)));
		{
			let mut state = rpc.state.lock().unwrap();
			state.accel_start_estimate = AccelerateEstimate {
				total_fee_sat: 1_000,
				delta_fee_sat: 500,
				max_fee_sat: 2_000,
			};
			// First execute succeeds; the following estimate reports the handle gone.
			state.accel_execute_results.push_back(Ok(()));
		}
		let outcome = accelerator(&rpc, 10_000, Some(0.10)).run().await.unwrap();

		// 1000 + (10000 - 1000) * 10% = 1900, under the backend's 2000 cap.
		let fees = rpc.state.lock().unwrap().accel_executed_fees.clone();
		assert_eq!(fees, vec![1_900]);
		assert!(outcome.accelerated);
		assert_eq!(outcome.final_fee_sat, Some(1_900));
	}

	#[tokio::test]
	async fn id_not_found_on_execute_is_success() {
		let rpc = Arc::new(TestRpc::new(node_id(0)));
		{
			let mut state = rpc.state.lock().unwrap();
			state.accel_start_estimate = AccelerateEstimate {
				total_fee_sat: 1_000,
				delta_fee_sat: 500,
				max_fee_sat: 2_000,
			};
			state.accel_execute_results.push_back(Err(RpcError::new(
				TXACCELERATE_ID_NOT_FOUND,
				"no such txacc_id",
			)));
		}
		let outcome = accelerator(&rpc, 10_000, None).run().await.unwrap();
		assert!(!outcome.accelerated);
		assert_eq!(outcome.final_fee_sat, None);
	}

	#[tokio::test]
	async fn bid_is_clamped_to_the_backend_maximum() {
		let rpc = Arc::new(TestRpc::new(node_id(0)));
		{
			let mut state = rpc.state.lock().unwrap();
			state.accel_start_estimate = AccelerateEstimate {
				total_fee_sat: 1_000,
				delta_fee_sat: 500,
				max_fee_sat: 1_200,
			};
			state.accel_execute_results.push_back(Ok(()));
		}
		accelerator(&rpc, 100_000, Some(0.5)).run().await.unwrap();
		// 1000 + 99000 * 50% would be 50500; the backend tops out at 1200.
		let fees = rpc.state.lock().unwrap().accel_executed_fees.clone();
		assert_eq!(fees, vec![1_200]);
	}

	#[tokio::test]
	async fn unaffordable_without_prior_acceleration_fails() {
		let rpc = Arc::new(TestRpc::new(node_id(0)));
		{
			let mut state = rpc.state.lock().unwrap();
			state.accel_start_estimate = AccelerateEstimate {
				total_fee_sat: 20_000,
				delta_fee_sat: 500,
				max_fee_sat: 50_000,
			};
		}
		let err = accelerator(&rpc, 10_000, None).run().await.unwrap_err();
		assert_eq!(err.code, TXACCELERATE_UNAFFORDABLE);
	}

	#[tokio::test]
	async fn cannot_afford_triggers_an_immediate_reestimate() {
		let rpc = Arc::new(TestRpc::new(node_id(0)));
		{
			let mut state = rpc.state.lock().unwrap();
			state.accel_start_estimate = AccelerateEstimate {
				total_fee_sat: 1_000,
				delta_fee_sat: 500,
				max_fee_sat: 2_000,
			};
			state
				.accel_execute_results
				.push_back(Err(RpcError::new(FUND_CANNOT_AFFORD, "funds moved")));
			// The re-estimate then reports a smaller wallet, the retry succeeds.
			state.accel_estimates.push_back(Ok(AccelerateEstimate {
				total_fee_sat: 1_000,
				delta_fee_sat: 200,
				max_fee_sat: 1_500,
			}));
			state.accel_execute_results.push_back(Ok(()));
		}
		let outcome = accelerator(&rpc, 10_000, Some(0.10)).run().await.unwrap();

		let state = rpc.state.lock().unwrap();
		assert_eq!(state.accel_executed_fees, vec![1_900, 1_500]);
		// No block gate between the failed execute and the retry: the first
		// waitblockheight only happens after the successful second execute.
		let first_wait = state
			.calls
			.iter()
			.position(|call| call.starts_with("waitblockheight"))
			.unwrap();
		let second_execute = state
			.calls
			.iter()
			.enumerate()
			.filter(|(_, call)| call.starts_with("txaccelerate_execute"))
			.map(|(index, _)| index)
			.nth(1)
			.unwrap();
		assert!(first_wait > second_execute);
		drop(state);
		assert_eq!(outcome.final_fee_sat, Some(1_500));
	}

	#[tokio::test]
	async fn stalled_backend_waits_for_blocks() {
		let rpc = Arc::new(TestRpc::new(node_id(0)));
		{
			let mut state = rpc.state.lock().unwrap();
			// Saturated: can't raise the fee at all right now.
			state.accel_start_estimate = AccelerateEstimate {
				total_fee_sat: 2_000,
				delta_fee_sat: 0,
				max_fee_sat: 2_000,
			};
			// After a block, headroom appears and the execute confirms the transaction.
			state.accel_estimates.push_back(Ok(AccelerateEstimate {
				total_fee_sat: 2_000,
				delta_fee_sat: 500,
				max_fee_sat: 4_000,
			}));
			state.accel_execute_results.push_back(Err(RpcError::new(
				TXACCELERATE_ID_NOT_FOUND,
				"confirmed meanwhile",
			)));
		}
		let outcome = accelerator(&rpc, 10_000, None).run().await.unwrap();
		let state = rpc.state.lock().unwrap();
		assert!(state.calls.iter().any(|call| call.starts_with("waitblockheight")));
		drop(state);
		assert!(!outcome.accelerated);
		assert_eq!(outcome.log.len(), 1);
	}
}
