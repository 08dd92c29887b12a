// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The cooperative refresher which keeps the distance cache current.
//!
//! A refresh is a full Dijkstra from the local node over the channel graph, writing each
//! node's landmark distance into the inactive slot of the [`Dhcache`]. Because the graph can
//! be large and the event loop must stay responsive, the Dijkstra is packaged as a
//! [`RefreshProcess`] which advances one queue-pop at a time; the [`DhcacheRefresher`] driver
//! runs batches of steps against a wall-clock budget and sleeps between batches so timers,
//! gossip and RPC traffic interleave freely.
//!
//! Refreshes are triggered per new block via [`DhcacheRefresher::deferred_trigger`] (the
//! deferral gives gossip time to digest the block first) or immediately via
//! [`DhcacheRefresher::immediate_trigger`]. On completion the cache flips and the coster used
//! for the cycle is published so pathfinders measure with the same metric the cache was
//! built with; on failure (the local node is not in the graph yet) the refresh is retried
//! after the deferral time.

use crate::routing::dhcache::{Dhcache, DhcacheWriter, DHCACHE_MAXIMUM_DISTANCE};
use crate::routing::gossip::{ChannelUpdateInfo, NetworkGraph, NodeId};
use crate::routing::heap::PriorityQueue;
use crate::util::logger::Logger;

use tokio::sync::Notify;

use core::ops::Deref;
use core::time::Duration;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Blocks per year assuming one block every ten minutes: 365.25 * 24 * 6.
pub const BLOCKS_PER_YEAR: u64 = 52596;

/// The default amount against which channel costs are sampled: 1 mBTC.
pub const DEFAULT_SAMPLE_AMOUNT_MSAT: u64 = 100_000_000;
/// The default riskfactor, in percent per annum.
pub const DEFAULT_RISKFACTOR: f64 = 10.0;
/// The default delay of a deferred refresh trigger.
pub const DEFAULT_DEFER_TIME: Duration = Duration::from_secs(10);

/// How long a wakeup of the refresher may spend stepping before it must yield.
const REFRESHER_WORKING_TIME: Duration = Duration::from_millis(10);
/// How long the refresher sleeps after exhausting its working time.
const REFRESHER_SLEEPING_TIME: Duration = Duration::from_millis(10);
/// How many steps run between checks of the working-time budget, so we do not spam the OS
/// for the current time.
const REFRESHER_STEPS_PER_TIME_CHECK: usize = 16;

/// The cost function shared by the refresher and by pathfinders reading the cache.
///
/// For the heuristic to stay admissible, a reader must measure channels with the coster of
/// the refresh cycle which produced its slot; use [`DhcacheRefresher::current_coster`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelCoster {
	/// The payment amount the cost is sampled at, in millisatoshis.
	pub sample_amount_msat: u64,
	/// How expensively locked-up time is valued, in percent per annum.
	pub riskfactor: f64,
}

impl ChannelCoster {
	/// The cost, in millisatoshis, of forwarding the sample amount across a half-channel:
	/// the fee charged plus the amount-scaled cost of the CLTV lockup.
	pub fn cost(&self, update: &ChannelUpdateInfo) -> u64 {
		let base = update.fees.base_msat as u64;
		let proportional = ((self.sample_amount_msat as u128
			* update.fees.proportional_millionths as u128
			+ 999_999) / 1_000_000) as u64;
		let riskfactor_per_block = self.riskfactor / BLOCKS_PER_YEAR as f64 / 100.0;
		let risk = (self.sample_amount_msat as f64
			* update.cltv_expiry_delta as f64
			* riskfactor_per_block) as u64;
		base.saturating_add(proportional).saturating_add(risk)
	}
}

/// The result of advancing a [`RefreshProcess`] by one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshStep {
	/// The process has more work to do.
	Continue,
	/// The process cannot run (the landmark is missing from the graph); the cache was not
	/// flipped and the refresh should be retried later.
	Failed,
	/// The writer slot now holds a complete distance map; the cache should be flipped.
	Completed,
}

enum ProcessState {
	Init,
	Loop,
}

/// A single refresh cycle: a resumable Dijkstra from the landmark into the writer slot.
pub struct RefreshProcess {
	state: ProcessState,
	queue: PriorityQueue<NodeId>,
	writer: DhcacheWriter,
	coster: ChannelCoster,
}

impl RefreshProcess {
	/// Starts a new refresh cycle against the given cache's current writer slot.
	pub fn new(dhcache: &Dhcache, coster: ChannelCoster) -> Self {
		RefreshProcess {
			state: ProcessState::Init,
			queue: PriorityQueue::new(),
			writer: dhcache.writer(),
			coster,
		}
	}

	/// The coster this cycle measures with.
	pub fn coster(&self) -> ChannelCoster {
		self.coster
	}

	/// Advances the Dijkstra by one step. Each step is a bounded amount of work: the
	/// initialization pass, or a single queue pop with relaxation of the popped node's
	/// channels.
	pub fn step<L: Deref>(&mut self, graph: &NetworkGraph<L>) -> RefreshStep
	where
		L::Target: Logger,
	{
		match self.state {
			ProcessState::Init => self.step_init(graph),
			ProcessState::Loop => self.step_loop(graph),
		}
	}

	fn step_init<L: Deref>(&mut self, graph: &NetworkGraph<L>) -> RefreshStep
	where
		L::Target: Logger,
	{
		let local_id = graph.local_id();
		let read = graph.read_only();
		let landmark = match read.node(&local_id) {
			Some(node) => node,
			None => return RefreshStep::Failed,
		};

		self.writer.clear_all(&read);
		self.writer.set_distance(landmark, 0);
		self.writer.mark_visited(landmark);
		self.queue.push(local_id, 0);

		self.state = ProcessState::Loop;
		RefreshStep::Continue
	}

	fn step_loop<L: Deref>(&mut self, graph: &NetworkGraph<L>) -> RefreshStep
	where
		L::Target: Logger,
	{
		let (priority, node_id) = match self.queue.pop() {
			Some(entry) => entry,
			None => return RefreshStep::Completed,
		};

		let read = graph.read_only();
		// The node may have disappeared under us while we were sleeping; if so just move on
		// to the next queue entry.
		let node = match read.node(&node_id) {
			Some(node) => node,
			None => return RefreshStep::Continue,
		};

		let node_total_cost = self.writer.get_distance(node);
		// A node re-pushed at a better distance leaves its old entry in the queue; skip it
		// when it surfaces.
		if priority > node_total_cost {
			return RefreshStep::Continue;
		}

		for scid in node.channels.iter() {
			let channel = match read.channel(*scid) {
				Some(channel) => channel,
				None => continue,
			};
			let direction = match channel.direction_from(&node_id) {
				Some(direction) => direction,
				None => continue,
			};
			let update = match channel.update_for(direction) {
				Some(update) => update,
				None => continue,
			};
			let neighbor_id = match channel.other_node(&node_id) {
				Some(id) => *id,
				None => continue,
			};
			let neighbor = match read.node(&neighbor_id) {
				Some(neighbor) => neighbor,
				None => continue,
			};

			let cost = self.coster.cost(update);
			let neighbor_total_cost = core::cmp::min(
				node_total_cost as u64 + cost,
				DHCACHE_MAXIMUM_DISTANCE as u64,
			) as u32;

			if !self.writer.get_visited(neighbor)
				|| self.writer.get_distance(neighbor) > neighbor_total_cost
			{
				self.writer.mark_visited(neighbor);
				self.writer.set_distance(neighbor, neighbor_total_cost);
				self.queue.push(neighbor_id, neighbor_total_cost);
			}
		}

		RefreshStep::Continue
	}
}

/// The refresher's tunables.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefresherSettings {
	/// The payment amount channel costs are sampled at, in millisatoshis.
	pub sample_amount_msat: u64,
	/// The riskfactor, in percent per annum.
	pub riskfactor: f64,
	/// How long a deferred trigger waits before starting a refresh.
	pub defer_time: Duration,
}

impl Default for RefresherSettings {
	fn default() -> Self {
		RefresherSettings {
			sample_amount_msat: DEFAULT_SAMPLE_AMOUNT_MSAT,
			riskfactor: DEFAULT_RISKFACTOR,
			defer_time: DEFAULT_DEFER_TIME,
		}
	}
}

struct RefresherState {
	process: Option<RefreshProcess>,
	deferred: Option<tokio::time::Instant>,
}

/// Drives [`RefreshProcess`]es against the event loop.
///
/// Construct one per [`NetworkGraph`], spawn [`DhcacheRefresher::run`] as a long-lived task
/// on the node's (current-thread) runtime, and call the trigger methods as blocks arrive.
pub struct DhcacheRefresher<G: Deref<Target = NetworkGraph<L>>, L: Deref>
where
	L::Target: Logger,
{
	graph: G,
	dhcache: Arc<Dhcache>,
	logger: L,
	settings: Mutex<RefresherSettings>,
	coster: Mutex<Option<ChannelCoster>>,
	state: Mutex<RefresherState>,
	trigger: Notify,
	refresh_cb: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<G: Deref<Target = NetworkGraph<L>>, L: Deref> DhcacheRefresher<G, L>
where
	L::Target: Logger,
{
	/// Creates a new refresher with default settings. `refresh_cb`, if given, fires after
	/// every completed refresh (i.e. after every flip of `dhcache`).
	pub fn new(
		graph: G, dhcache: Arc<Dhcache>, logger: L,
		refresh_cb: Option<Box<dyn Fn() + Send + Sync>>,
	) -> Self {
		DhcacheRefresher {
			graph,
			dhcache,
			logger,
			settings: Mutex::new(RefresherSettings::default()),
			coster: Mutex::new(None),
			state: Mutex::new(RefresherState { process: None, deferred: None }),
			trigger: Notify::new(),
			refresh_cb,
		}
	}

	/// The cache this refresher maintains.
	pub fn dhcache(&self) -> &Arc<Dhcache> {
		&self.dhcache
	}

	/// The current tunables.
	pub fn settings(&self) -> RefresherSettings {
		*self.settings.lock().unwrap()
	}

	/// Replaces the tunables. Takes effect from the next refresh cycle.
	pub fn set_settings(&self, settings: RefresherSettings) {
		*self.settings.lock().unwrap() = settings;
	}

	/// The coster of the refresh cycle backing the current reader slot, or `None` before the
	/// first completed refresh.
	pub fn current_coster(&self) -> Option<ChannelCoster> {
		*self.coster.lock().unwrap()
	}

	/// Starts a refresh right now. Cancels any pending deferred trigger; does nothing if a
	/// refresh is already running.
	pub fn immediate_trigger(&self) {
		let mut state = self.state.lock().unwrap();
		state.deferred = None;
		if state.process.is_some() {
			return;
		}
		let settings = *self.settings.lock().unwrap();
		let coster = ChannelCoster {
			sample_amount_msat: settings.sample_amount_msat,
			riskfactor: settings.riskfactor,
		};
		log_trace!(self.logger, "Starting distance-cache refresh process");
		state.process = Some(RefreshProcess::new(&self.dhcache, coster));
		drop(state);
		self.trigger.notify_one();
	}

	/// Schedules a refresh after the deferral time. Does nothing if a refresh is running or
	/// a deferred trigger is already pending. Intended to be called once per new block,
	/// giving gossip time to catch up before we measure.
	pub fn deferred_trigger(&self) {
		let mut state = self.state.lock().unwrap();
		if state.process.is_some() || state.deferred.is_some() {
			return;
		}
		let defer_time = self.settings.lock().unwrap().defer_time;
		state.deferred = Some(tokio::time::Instant::now() + defer_time);
		drop(state);
		self.trigger.notify_one();
	}

	/// The refresher's main loop. Runs forever; spawn it once on the node's runtime.
	pub async fn run(&self) {
		loop {
			enum Wake {
				Idle,
				Deferred(tokio::time::Instant),
				Work,
			}
			let wake = {
				let state = self.state.lock().unwrap();
				if state.process.is_some() {
					Wake::Work
				} else if let Some(at) = state.deferred {
					Wake::Deferred(at)
				} else {
					Wake::Idle
				}
			};
			match wake {
				Wake::Idle => self.trigger.notified().await,
				Wake::Deferred(at) => {
					tokio::select! {
						_ = self.trigger.notified() => {},
						_ = tokio::time::sleep_until(at) => self.immediate_trigger(),
					}
				},
				Wake::Work => self.drive_process().await,
			}
		}
	}

	/// Runs the installed process until it finishes or the working-time budget runs out.
	async fn drive_process(&self) {
		enum Batch {
			Working,
			Failed,
			Completed(ChannelCoster),
		}
		let start = Instant::now();
		loop {
			let batch = {
				let mut state = self.state.lock().unwrap();
				let process = match state.process.as_mut() {
					Some(process) => process,
					None => return,
				};
				let mut batch = Batch::Working;
				for _ in 0..REFRESHER_STEPS_PER_TIME_CHECK {
					match process.step(&*self.graph) {
						RefreshStep::Continue => continue,
						RefreshStep::Failed => {
							batch = Batch::Failed;
							break;
						},
						RefreshStep::Completed => {
							batch = Batch::Completed(process.coster());
							break;
						},
					}
				}
				if !matches!(batch, Batch::Working) {
					state.process = None;
				}
				batch
			};
			match batch {
				Batch::Failed => {
					log_debug!(self.logger, "Distance-cache refresh failed, deferring a retry");
					self.deferred_trigger();
					return;
				},
				Batch::Completed(coster) => {
					self.dhcache.flip();
					*self.coster.lock().unwrap() = Some(coster);
					log_debug!(self.logger, "Distance-cache refresh completed");
					if let Some(cb) = &self.refresh_cb {
						cb();
					}
					return;
				},
				Batch::Working => {},
			}
			if start.elapsed() >= REFRESHER_WORKING_TIME {
				log_trace!(self.logger, "Distance-cache refresh yielding to the event loop");
				tokio::time::sleep(REFRESHER_SLEEPING_TIME).await;
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::routing::gossip::{RoutingFees, NetworkGraph};
	use crate::util::test_utils::{node_id, TestLogger};

	fn flat_fee_update(base_msat: u32) -> ChannelUpdateInfo {
		ChannelUpdateInfo {
			last_update: 0,
			enabled: true,
			cltv_expiry_delta: 0,
			htlc_minimum_msat: 0,
			htlc_maximum_msat: 10_000_000_000,
			fees: RoutingFees { base_msat, proportional_millionths: 0 },
		}
	}

	fn add_symmetric_channel(
		graph: &NetworkGraph<Arc<TestLogger>>, scid: u64, a: u8, b: u8, cost_msat: u32,
	) {
		graph.add_channel(scid, node_id(a), node_id(b), None).unwrap();
		graph.update_channel(scid, 0, flat_fee_update(cost_msat)).unwrap();
		graph.update_channel(scid, 1, flat_fee_update(cost_msat)).unwrap();
	}

	/// The landmark L plus A, B, G: L-A costs 10, A-B 3, B-G 7, and a long way around L-G
	/// at 100.
	fn diamond_graph() -> NetworkGraph<Arc<TestLogger>> {
		let graph = NetworkGraph::new(node_id(0), Arc::new(TestLogger::new()));
		add_symmetric_channel(&graph, 1, 0, 1, 10); // L-A
		add_symmetric_channel(&graph, 2, 1, 2, 3); // A-B
		add_symmetric_channel(&graph, 3, 2, 3, 7); // B-G
		add_symmetric_channel(&graph, 4, 0, 3, 100); // L-G
		graph
	}

	fn run_process_to_completion(
		process: &mut RefreshProcess, graph: &NetworkGraph<Arc<TestLogger>>,
	) -> RefreshStep {
		for _ in 0..10_000 {
			match process.step(graph) {
				RefreshStep::Continue => continue,
				other => return other,
			}
		}
		panic!("refresh process failed to terminate");
	}

	fn test_coster() -> ChannelCoster {
		ChannelCoster { sample_amount_msat: DEFAULT_SAMPLE_AMOUNT_MSAT, riskfactor: 0.0 }
	}

	#[test]
	fn coster_combines_fee_and_risk_terms() {
		let coster =
			ChannelCoster { sample_amount_msat: 100_000_000, riskfactor: DEFAULT_RISKFACTOR };
		let update = ChannelUpdateInfo {
			last_update: 0,
			enabled: true,
			cltv_expiry_delta: 144,
			htlc_minimum_msat: 0,
			htlc_maximum_msat: 0,
			fees: RoutingFees { base_msat: 1_000, proportional_millionths: 10 },
		};
		// base 1000 + ceil(100_000_000 * 10 / 1e6) = 1000 + 1000, plus
		// 10%/annum on 144 blocks of 100_000_000: 1e8 * 144 * 10 / (52596 * 100) = 27378.
		assert_eq!(coster.cost(&update), 1_000 + 1_000 + 27_378);
		// The proportional part rounds up.
		let coster = ChannelCoster { sample_amount_msat: 999_999, riskfactor: 0.0 };
		let update = ChannelUpdateInfo {
			fees: RoutingFees { base_msat: 0, proportional_millionths: 1 },
			..update
		};
		assert_eq!(coster.cost(&update), 1);
	}

	#[test]
	fn refresh_measures_landmark_distances() {
		let graph = diamond_graph();
		let dhcache = Dhcache::new();
		let mut process = RefreshProcess::new(&dhcache, test_coster());
		assert_eq!(run_process_to_completion(&mut process, &graph), RefreshStep::Completed);
		dhcache.flip();

		let read = graph.read_only();
		let goal = read.node(&node_id(3)).unwrap();
		let reader = dhcache.reader(goal);
		// d(L)=0, d(A)=10, d(B)=13, d(G)=20 (via B, not the 100-cost direct channel).
		assert_eq!(reader.distance(read.node(&node_id(0)).unwrap()), 20);
		assert_eq!(reader.distance(read.node(&node_id(1)).unwrap()), 10);
		assert_eq!(reader.distance(read.node(&node_id(2)).unwrap()), 7);
		assert_eq!(reader.distance(goal), 0);
		for i in 0..4 {
			assert!(reader.is_reachable(read.node(&node_id(i)).unwrap()));
		}
	}

	#[test]
	fn heuristic_is_admissible_on_the_test_graph() {
		let graph = diamond_graph();
		let dhcache = Dhcache::new();
		let mut process = RefreshProcess::new(&dhcache, test_coster());
		run_process_to_completion(&mut process, &graph);
		dhcache.flip();

		// True shortest costs to G: L=20, A=10, B=7, G=0.
		let true_cost = [20u32, 10, 7, 0];
		let read = graph.read_only();
		let reader = dhcache.reader(read.node(&node_id(3)).unwrap());
		for (i, cost) in true_cost.iter().enumerate() {
			assert!(reader.distance(read.node(&node_id(i as u8)).unwrap()) <= *cost);
		}
	}

	#[test]
	fn missing_landmark_fails_the_process() {
		let graph = NetworkGraph::new(node_id(99), Arc::new(TestLogger::new()));
		add_symmetric_channel(&graph, 1, 0, 1, 10);
		let dhcache = Dhcache::new();
		let mut process = RefreshProcess::new(&dhcache, test_coster());
		assert_eq!(process.step(&graph), RefreshStep::Failed);
		assert!(!dhcache.available());
	}

	#[test]
	fn nodes_disappearing_mid_refresh_are_skipped() {
		let graph = diamond_graph();
		let dhcache = Dhcache::new();
		let mut process = RefreshProcess::new(&dhcache, test_coster());
		// Init, then expand the landmark, queueing A and G.
		assert_eq!(process.step(&graph), RefreshStep::Continue);
		assert_eq!(process.step(&graph), RefreshStep::Continue);
		// A vanishes (taking L-A and A-B with it) before its queue entry surfaces.
		graph.remove_node(&node_id(1));
		assert_eq!(run_process_to_completion(&mut process, &graph), RefreshStep::Completed);
		dhcache.flip();

		// Only the direct 100-cost channel remains towards G.
		let read = graph.read_only();
		let reader = dhcache.reader(read.node(&node_id(3)).unwrap());
		assert_eq!(reader.distance(read.node(&node_id(0)).unwrap()), 100);
		// B is now only reachable through G, at 107, so its differential to G is 7.
		assert_eq!(reader.distance(read.node(&node_id(2)).unwrap()), 7);
	}

	#[test]
	fn a_reader_is_isolated_from_an_in_progress_refresh() {
		let graph = diamond_graph();
		let dhcache = Dhcache::new();
		let mut process = RefreshProcess::new(&dhcache, test_coster());
		run_process_to_completion(&mut process, &graph);
		drop(process);
		dhcache.flip();

		let reader = {
			let read = graph.read_only();
			let reader = dhcache.reader(read.node(&node_id(3)).unwrap());
			assert_eq!(reader.distance(read.node(&node_id(1)).unwrap()), 10);
			reader
		};

		// The graph shifts and a whole second refresh completes into the writer slot. Until
		// the next flip, the captured reader keeps seeing its own, pre-flip cycle.
		graph.update_channel(1, 0, flat_fee_update(50)).unwrap();
		graph.update_channel(1, 1, flat_fee_update(50)).unwrap();
		let mut second = RefreshProcess::new(&dhcache, test_coster());
		run_process_to_completion(&mut second, &graph);

		let read = graph.read_only();
		assert_eq!(reader.distance(read.node(&node_id(1)).unwrap()), 10);
		assert_eq!(reader.distance(read.node(&node_id(0)).unwrap()), 20);
	}

	#[tokio::test]
	async fn run_loop_completes_a_triggered_refresh() {
		let graph = Arc::new(diamond_graph());
		let dhcache = Arc::new(Dhcache::new());
		let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
		let refresher = Arc::new(DhcacheRefresher::new(
			Arc::clone(&graph),
			Arc::clone(&dhcache),
			Arc::new(TestLogger::new()),
			Some(Box::new(move || {
				tx.send(()).unwrap();
			})),
		));

		let runner = Arc::clone(&refresher);
		let handle = tokio::spawn(async move { runner.run().await });

		refresher.immediate_trigger();
		tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();

		assert!(dhcache.available());
		let coster = refresher.current_coster().unwrap();
		assert_eq!(coster.sample_amount_msat, DEFAULT_SAMPLE_AMOUNT_MSAT);
		let read = graph.read_only();
		let reader = dhcache.reader(read.node(&node_id(3)).unwrap());
		assert_eq!(reader.distance(read.node(&node_id(2)).unwrap()), 7);

		handle.abort();
	}

	#[tokio::test]
	async fn deferred_trigger_fires_after_the_defer_time() {
		let graph = Arc::new(diamond_graph());
		let dhcache = Arc::new(Dhcache::new());
		let refresher = Arc::new(DhcacheRefresher::new(
			Arc::clone(&graph),
			Arc::clone(&dhcache),
			Arc::new(TestLogger::new()),
			None,
		));
		let mut settings = refresher.settings();
		settings.defer_time = Duration::from_millis(10);
		refresher.set_settings(settings);

		let runner = Arc::clone(&refresher);
		let handle = tokio::spawn(async move { runner.run().await });

		refresher.deferred_trigger();
		// A second deferred trigger while one is pending is a no-op.
		refresher.deferred_trigger();

		tokio::time::timeout(Duration::from_secs(10), async {
			while !dhcache.available() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();

		handle.abort();
	}
}
