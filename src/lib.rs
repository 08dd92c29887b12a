// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![crate_name = "ln_router"]

//! The payment-routing core of a Lightning node, in library form.
//!
//! This crate contains the route-discovery and channel-funding machinery which sits between a
//! gossip-maintained channel graph and the actual HTLC machinery: a differential-heuristic
//! distance cache refreshed cooperatively against an event loop, a path-diversity engine which
//! turns a shortest-route primitive into a stream of distinct routes, a route-repair procedure
//! which splices around a failed hop, and an orchestrator which opens channels to many peers
//! with a single funding transaction.
//!
//! Everything the node itself must provide - gossip ingest, the channel protocol, the wallet,
//! transaction broadcast - is consumed through the [`rpc::LightningRpc`] trait, so this crate
//! never makes policy decisions about networking or key material.
//!
//! The crate assumes a cooperative, effectively single-threaded scheduling model: long-running
//! work yields only at `await` points and is correct on a current-thread runtime.

#![cfg_attr(not(any(test, feature = "_test_utils")), deny(missing_docs))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![forbid(unsafe_code)]

extern crate bitcoin;
extern crate tokio;

#[macro_use]
pub mod util;
pub mod ln;
pub mod routing;
pub mod rpc;
