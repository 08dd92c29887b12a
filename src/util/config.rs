// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Chain-level configuration, established once at startup and injected into the modules which
//! need it.

/// Per-chain constants which bound what this node is willing to put on-chain.
///
/// These correspond to the chain the node was started on and never change at runtime. Modules
/// take a copy at construction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainParams {
	/// The largest channel value, in satoshis, a peer without the large-channel feature will
	/// accept.
	pub max_funding_sats: u64,
	/// Outputs below this value, in satoshis, are considered dust and will be rejected.
	pub dust_limit_sats: u64,
}

impl Default for ChainParams {
	fn default() -> Self {
		ChainParams {
			// Pre-wumbo channel ceiling of 2^24 - 1 satoshis.
			max_funding_sats: 16_777_215,
			dust_limit_sats: 546,
		}
	}
}
