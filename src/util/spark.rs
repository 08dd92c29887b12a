// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Sparks: cooperatively-scheduled subtasks tied to a command.
//!
//! A command which needs to issue several backend requests concurrently - e.g. one
//! `fundchannel_start` per peer - wraps each request in a [`Spark`] and then blocks on
//! [`wait_all_sparks`]. A spark does not begin executing until the owning command awaits it,
//! i.e. until the command itself yields, so spark bodies may freely borrow command state
//! captured at creation time.
//!
//! Sparks are tied to their command by ownership: when the command completes (or its future is
//! dropped), any spark it has not waited on is dropped with it, abandoning whatever backend
//! request the spark had in flight. There can only be one waiter on a given spark, which the
//! type system enforces by making waiting consume it.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

/// A subtask running concurrently with the command that created it.
///
/// Created by [`start_spark`]. A `Spark` is itself a future resolving to the body's output;
/// await it directly to wait for just this spark, or hand a batch to [`wait_all_sparks`].
pub struct Spark<'a, T> {
	fut: Pin<Box<dyn Future<Output = T> + Send + 'a>>,
}

/// Starts a new spark executing `body`.
///
/// The body is not polled until the returned spark is awaited (directly or through
/// [`wait_all_sparks`]), so ordering between spark creation and command-side preparation is
/// never observable to the body.
pub fn start_spark<'a, T, F>(body: F) -> Spark<'a, T>
where
	F: Future<Output = T> + Send + 'a,
{
	Spark { fut: Box::pin(body) }
}

impl<'a, T> Future for Spark<'a, T> {
	type Output = T;
	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
		self.fut.as_mut().poll(cx)
	}
}

/// Waits for every spark in `sparks` to signal completion, returning their outputs in the
/// order the sparks were given.
///
/// All sparks make progress while any of them is pending; a slow spark does not prevent its
/// siblings from running. Dropping the returned future cancels every spark which has not yet
/// completed.
pub fn wait_all_sparks<'a, T>(sparks: Vec<Spark<'a, T>>) -> MultiSparkPoller<'a, T> {
	let results = sparks.iter().map(|_| None).collect();
	MultiSparkPoller { sparks: sparks.into_iter().map(Some).collect(), results }
}

/// Future returned by [`wait_all_sparks`].
pub struct MultiSparkPoller<'a, T> {
	sparks: Vec<Option<Spark<'a, T>>>,
	results: Vec<Option<T>>,
}

// `results` only ever stores completed spark outputs and `sparks` wraps its futures in
// `Pin<Box<..>>` internally, so moving a `MultiSparkPoller` around is always sound.
impl<'a, T> Unpin for MultiSparkPoller<'a, T> {}

impl<'a, T> Future for MultiSparkPoller<'a, T> {
	type Output = Vec<T>;
	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Vec<T>> {
		let this = self.get_mut();
		let mut have_pending_sparks = false;
		for (spark_option, result) in this.sparks.iter_mut().zip(this.results.iter_mut()) {
			let mut spark = match spark_option.take() {
				None => continue,
				Some(spark) => spark,
			};
			match Pin::new(&mut spark).poll(cx) {
				Poll::Ready(output) => *result = Some(output),
				Poll::Pending => {
					have_pending_sparks = true;
					*spark_option = Some(spark);
				},
			}
		}
		if have_pending_sparks {
			Poll::Pending
		} else {
			Poll::Ready(this.results.iter_mut().map(|result| result.take().unwrap()).collect())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	#[tokio::test]
	async fn spark_body_is_lazy() {
		let started = Arc::new(AtomicUsize::new(0));
		let started_inner = Arc::clone(&started);
		let spark = start_spark(async move {
			started_inner.fetch_add(1, Ordering::SeqCst);
			42
		});
		// Creating the spark must not run its body; only awaiting it does.
		assert_eq!(started.load(Ordering::SeqCst), 0);
		assert_eq!(spark.await, 42);
		assert_eq!(started.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn wait_all_sparks_returns_outputs_in_creation_order() {
		let sparks = vec![
			start_spark(async {
				tokio::task::yield_now().await;
				tokio::task::yield_now().await;
				1u32
			}),
			start_spark(async { 2u32 }),
			start_spark(async {
				tokio::task::yield_now().await;
				3u32
			}),
		];
		assert_eq!(wait_all_sparks(sparks).await, vec![1, 2, 3]);
	}

	#[tokio::test]
	async fn wait_all_sparks_on_empty_set_completes_immediately() {
		let sparks: Vec<Spark<u32>> = Vec::new();
		assert_eq!(wait_all_sparks(sparks).await, Vec::<u32>::new());
	}

	#[tokio::test]
	async fn dropping_the_command_cancels_unfinished_sparks() {
		struct CompletionFlag(Arc<AtomicUsize>);
		impl Drop for CompletionFlag {
			fn drop(&mut self) {
				self.0.fetch_add(1, Ordering::SeqCst);
			}
		}

		let completed = Arc::new(AtomicUsize::new(0));
		let dropped = Arc::new(AtomicUsize::new(0));
		let completed_inner = Arc::clone(&completed);
		let flag = CompletionFlag(Arc::clone(&dropped));
		let spark = start_spark(async move {
			let _flag = flag;
			// Yield forever; the spark only ends by being dropped.
			loop {
				tokio::task::yield_now().await;
				completed_inner.fetch_add(1, Ordering::SeqCst);
			}
		});
		drop(spark);
		assert_eq!(dropped.load(Ordering::SeqCst), 1);
		assert_eq!(completed.load(Ordering::SeqCst), 0);
	}
}
