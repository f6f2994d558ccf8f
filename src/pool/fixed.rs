//! Reuse of expensive objects, with optional background rebalancing
use std::{
	collections::VecDeque,
	fmt::Display,
	sync::{Arc, Weak},
	time::Duration,
};

use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Constructs the objects of a [`FixedPool`].
///
/// Implemented for closures returning a `Result`.
pub trait Factory<T>: Send + Sync + 'static {
	/// Error of a failed construction.
	type Error;

	/// Construct a new object.
	fn create(&self) -> Result<T, Self::Error>;
}

impl<T, E, F> Factory<T> for F
where
	F: Fn() -> Result<T, E> + Send + Sync + 'static,
{
	type Error = E;

	fn create(&self) -> Result<T, E> {
		self()
	}
}

/// Settings of the background task keeping the number of idle objects of a
/// [`FixedPool`] within bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceConfig {
	/// Objects are created when fewer than this many are idle.
	pub min_idle: usize,
	/// Objects are dropped when more than this many are idle. Raised to
	/// `min_idle` if lower.
	pub max_idle: usize,
	/// Delay between checks. At least one millisecond.
	pub interval: Duration,
}

/// State shared between a [`FixedPool`] and its background task.
struct Inner<T, F> {
	/// Idle objects; borrowed from the front, returned to the back.
	idle: Mutex<VecDeque<T>>,
	/// Constructs new objects.
	factory: F,
}

impl<T, F: Factory<T>> Inner<T, F> {
	/// Add `count` new objects to the idle set.
	fn fill(&self, count: usize) -> Result<(), F::Error> {
		for _ in 0..count {
			let object = self.factory.create()?;
			self.idle.lock().push_back(object);
		}
		Ok(())
	}

	/// Move the idle count into `[min_idle, max_idle]`.
	fn rebalance(&self, config: &RebalanceConfig)
	where
		F::Error: Display,
	{
		let size = self.idle.lock().len();
		if size < config.min_idle {
			debug!(size, min_idle = config.min_idle, "Topping up pool");
			if let Err(err) = self.fill(config.min_idle - size) {
				warn!("Creating pooled object failed: {err}");
			}
		} else if size > config.max_idle {
			debug!(size, max_idle = config.max_idle, "Trimming pool");
			let mut idle = self.idle.lock();
			let excess = idle.len().saturating_sub(config.max_idle);
			idle.drain(..excess);
		}
	}
}

/// A pool of reusable objects.
///
/// Borrowing never waits on construction: the idle objects sit behind a
/// short-held lock, and when none is available a new one is constructed on
/// the spot. Returned objects become available to later
/// borrows. Objects are not validated or reset on their way through the
/// pool.
///
/// A pool created with [`FixedPool::with_rebalance`] runs a background task
/// on the current tokio runtime which periodically tops up or trims the idle
/// objects. The task races with borrows and returns, so the idle count
/// converges towards the configured band rather than being held in it.
/// Failed constructions in the background are logged and retried on the next
/// check.
pub struct FixedPool<T, F> {
	/// Shared state.
	inner: Arc<Inner<T, F>>,
	/// Stops the background task.
	cancel: Option<CancellationToken>,
}

impl<T, F> std::fmt::Debug for FixedPool<T, F> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FixedPool")
			.field("idle", &self.inner.idle.lock().len())
			.field("rebalancing", &self.cancel.as_ref().map(|cancel| !cancel.is_cancelled()))
			.finish()
	}
}

impl<T, F> FixedPool<T, F>
where
	T: Send + 'static,
	F: Factory<T>,
{
	/// Create a pool holding `min_idle` idle objects.
	pub fn new(factory: F, min_idle: usize) -> Result<Self, F::Error> {
		let inner = Inner { idle: Mutex::new(VecDeque::with_capacity(min_idle)), factory };
		inner.fill(min_idle)?;
		Ok(Self { inner: Arc::new(inner), cancel: None })
	}

	/// Create a pool holding `config.min_idle` idle objects, and start a task
	/// keeping the idle count between `min_idle` and `max_idle`. The first
	/// check runs one interval from now.
	///
	/// # Panics
	/// If called outside of a tokio runtime.
	pub fn with_rebalance(factory: F, config: RebalanceConfig) -> Result<Self, F::Error>
	where
		F::Error: Display,
	{
		let config = RebalanceConfig {
			max_idle: config.max_idle.max(config.min_idle),
			interval: config.interval.max(Duration::from_millis(1)),
			..config
		};
		let mut pool = Self::new(factory, config.min_idle)?;

		let cancel = CancellationToken::new();
		tokio::spawn(run_rebalance_loop(Arc::downgrade(&pool.inner), config, cancel.clone()));
		pool.cancel = Some(cancel);
		Ok(pool)
	}

	/// Take an idle object, or construct a new one if none is idle.
	pub fn borrow_object(&self) -> Result<T, F::Error> {
		let idle = self.inner.idle.lock().pop_front();
		match idle {
			Some(object) => Ok(object),
			None => self.inner.factory.create(),
		}
	}

	/// Put an object back for reuse.
	pub fn return_object(&self, object: T) {
		self.inner.idle.lock().push_back(object);
	}

	/// Number of idle objects.
	#[must_use]
	pub fn idle_count(&self) -> usize {
		self.inner.idle.lock().len()
	}

	/// Stop the background task, if any. Idle objects are left in place.
	pub fn shutdown(&self) {
		if let Some(cancel) = &self.cancel {
			cancel.cancel();
		}
	}
}

impl<T, F> Drop for FixedPool<T, F> {
	fn drop(&mut self) {
		if let Some(cancel) = &self.cancel {
			cancel.cancel();
		}
	}
}

/// Periodically rebalance the pool until cancelled or the pool is gone.
async fn run_rebalance_loop<T, F>(
	inner: Weak<Inner<T, F>>,
	config: RebalanceConfig,
	cancel: CancellationToken,
) where
	F: Factory<T>,
	F::Error: Display,
{
	let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	info!(
		min_idle = config.min_idle,
		max_idle = config.max_idle,
		interval_ms = config.interval.as_millis(),
		"Pool rebalancing started"
	);

	loop {
		tokio::select! {
			() = cancel.cancelled() => break,
			_ = ticker.tick() => {
				let Some(inner) = inner.upgrade() else {
					break;
				};
				inner.rebalance(&config);
			}
		}
	}

	info!("Pool rebalancing stopped");
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{
		convert::Infallible,
		sync::{
			atomic::{AtomicBool, AtomicUsize, Ordering},
			Arc,
		},
		time::Duration,
	};

	use super::{FixedPool, RebalanceConfig};

	/// A factory numbering the objects it creates.
	fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Result<usize, Infallible> + Send + Sync) {
		let created = Arc::new(AtomicUsize::new(0));
		let factory = {
			let created = Arc::clone(&created);
			move || Ok(created.fetch_add(1, Ordering::SeqCst))
		};
		(created, factory)
	}

	fn band() -> RebalanceConfig {
		RebalanceConfig { min_idle: 2, max_idle: 5, interval: Duration::from_secs(1) }
	}

	#[test]
	fn borrow_from_empty_pool_creates() {
		let (created, factory) = counter();
		let pool = FixedPool::new(factory, 0).unwrap();

		assert_eq!(pool.idle_count(), 0);
		let object = pool.borrow_object().unwrap();
		assert_eq!(created.load(Ordering::SeqCst), 1);

		pool.return_object(object);
		assert_eq!(pool.idle_count(), 1);
		assert_eq!(pool.borrow_object().unwrap(), object, "The idle object is reused");
		assert_eq!(created.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn initial_fill() {
		let (created, factory) = counter();
		let pool = FixedPool::new(factory, 3).unwrap();
		assert_eq!(pool.idle_count(), 3);
		assert_eq!(created.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn factory_errors_pass_through() {
		let failing = || -> Result<(), String> { Err("no connection".to_owned()) };
		assert_eq!(FixedPool::new(failing, 1).err(), Some("no connection".to_owned()));

		let pool = FixedPool::new(failing, 0).unwrap();
		assert_eq!(pool.borrow_object(), Err("no connection".to_owned()));
	}

	#[test]
	fn concurrent_borrow_and_return() {
		let (created, factory) = counter();
		let pool = FixedPool::new(factory, 4).unwrap();

		std::thread::scope(|scope| {
			for _ in 0..4 {
				scope.spawn(|| {
					for _ in 0..100 {
						let object = pool.borrow_object().unwrap();
						pool.return_object(object);
					}
				});
			}
		});
		assert_eq!(pool.idle_count(), created.load(Ordering::SeqCst));
	}

	#[tokio::test(start_paused = true)]
	async fn rebalances_toward_band() {
		let (_, factory) = counter();
		let pool = FixedPool::with_rebalance(factory, band()).unwrap();
		assert_eq!(pool.idle_count(), 2);

		let borrowed = [pool.borrow_object().unwrap(), pool.borrow_object().unwrap()];
		assert_eq!(pool.idle_count(), 0);
		tokio::time::sleep(Duration::from_millis(1500)).await;
		assert!(pool.idle_count() >= 2, "Pool should be topped up");

		for object in borrowed.into_iter().chain(100..108) {
			pool.return_object(object);
		}
		assert!(pool.idle_count() >= 10);
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert!(pool.idle_count() <= 5, "Pool should be trimmed");
		assert!(pool.idle_count() >= 2);
	}

	#[tokio::test(start_paused = true)]
	async fn background_failures_do_not_stop_rebalancing() {
		let failing = Arc::new(AtomicBool::new(false));
		let factory = {
			let failing = Arc::clone(&failing);
			move || {
				if failing.load(Ordering::SeqCst) {
					Err("directory unavailable")
				} else {
					Ok(())
				}
			}
		};
		let pool = FixedPool::with_rebalance(factory, band()).unwrap();

		failing.store(true, Ordering::SeqCst);
		pool.inner.idle.lock().clear();
		tokio::time::sleep(Duration::from_millis(1500)).await;
		assert_eq!(pool.idle_count(), 0);

		failing.store(false, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(pool.idle_count(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_stops_rebalancing() {
		let (_, factory) = counter();
		let pool = FixedPool::with_rebalance(factory, band()).unwrap();

		pool.shutdown();
		pool.shutdown();
		let _first = pool.borrow_object().unwrap();
		let _second = pool.borrow_object().unwrap();

		tokio::time::sleep(Duration::from_secs(3)).await;
		assert_eq!(pool.idle_count(), 0, "No top up after shutdown");
	}
}
