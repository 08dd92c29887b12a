// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Connects to many peers at once.
//!
//! Peer connections are slow - each one is a network round trip to a host we do not control -
//! so connecting serially to N peers takes the sum of their latencies. One spark per peer
//! takes only the slowest. Used standalone and as the first stage of
//! [`crate::ln::multifund`], where being connected also collects each peer's feature bits
//! for later validation.

use crate::rpc::{LightningRpc, PeerConnection, RpcError};
use crate::util::logger::Logger;
use crate::util::spark::{start_spark, wait_all_sparks};

use core::ops::Deref;

/// Connects to every listed peer concurrently, given `id[@host[:port]]` strings.
///
/// Returns the canonical id and feature bits of each peer, in input order. Every connection
/// attempt runs to completion; if any failed, the first failure (in input order) is
/// returned.
pub async fn multi_connect<R: Deref, L: Deref>(
	rpc: &R, logger: &L, ids: &[String],
) -> Result<Vec<PeerConnection>, RpcError>
where
	R::Target: LightningRpc,
	L::Target: Logger,
{
	if ids.is_empty() {
		return Err(RpcError::invalid_params("Empty 'id' array: nothing to connect."));
	}

	log_debug!(logger, "Connecting to {} peers", ids.len());

	let backend = &**rpc;
	let sparks = ids
		.iter()
		.map(|id| start_spark(async move { backend.connect_peer(id).await }))
		.collect();
	let results = wait_all_sparks(sparks).await;

	let mut connections = Vec::with_capacity(results.len());
	for (id, result) in ids.iter().zip(results) {
		match result {
			Ok(connection) => connections.push(connection),
			Err(err) => {
				log_debug!(logger, "Connecting to {} failed: {}", id, err);
				return Err(err.with_command("connect"));
			},
		}
	}
	Ok(connections)
}
