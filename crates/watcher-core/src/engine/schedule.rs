//! Periodic job runner.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Runs `job` immediately and then again `interval` after each run completes,
/// until `shutdown` turns true or its sender is dropped.
///
/// A run in progress is always allowed to finish; shutdown is only observed
/// between runs.
pub async fn run_every<F, Fut>(interval: Duration, mut shutdown: watch::Receiver<bool>, mut job: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = ()>,
{
	loop {
		if *shutdown.borrow() {
			break;
		}
		job().await;

		tokio::select! {
			_ = tokio::time::sleep(interval) => {}
			changed = shutdown.changed() => {
				if changed.is_err() || *shutdown.borrow() {
					break;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Arc;

	#[tokio::test(start_paused = true)]
	async fn test_runs_until_shutdown() {
		let (tx, rx) = watch::channel(false);
		let runs = Arc::new(AtomicU32::new(0));

		let counter = runs.clone();
		let handle = tokio::spawn(run_every(Duration::from_secs(10), rx, move || {
			let counter = counter.clone();
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
			}
		}));

		tokio::time::sleep(Duration::from_secs(25)).await;
		tx.send(true).unwrap();
		handle.await.unwrap();

		// Runs at t=0, 10 and 20.
		assert_eq!(runs.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_interval_starts_after_job_finishes() {
		let (tx, rx) = watch::channel(false);
		let starts = Arc::new(tokio::sync::Mutex::new(Vec::new()));

		let log = starts.clone();
		let origin = tokio::time::Instant::now();
		let handle = tokio::spawn(run_every(Duration::from_secs(10), rx, move || {
			let log = log.clone();
			async move {
				log.lock().await.push(origin.elapsed().as_secs());
				tokio::time::sleep(Duration::from_secs(5)).await;
			}
		}));

		tokio::time::sleep(Duration::from_secs(31)).await;
		drop(tx);
		handle.await.unwrap();

		assert_eq!(*starts.lock().await, vec![0, 15, 30]);
	}
}
