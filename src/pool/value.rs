//! Deduplication of equal values
use std::{
	collections::{hash_map::RandomState, HashMap, VecDeque},
	hash::{BuildHasher, Hash},
	sync::{
		atomic::{AtomicU64, AtomicUsize, Ordering},
		Arc, Weak,
	},
};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Number of recently registered values a [`ValuePool`] keeps alive by
/// default.
pub const DEFAULT_RETENTION: usize = 1024;

/// Hit statistics are logged every this many lookups.
const STATS_INTERVAL: u64 = 500;

/// Bucket count below which registration never sweeps reclaimed slots.
const MIN_SWEEP_THRESHOLD: usize = 64;

/// A pool of shared canonical instances of immutable values.
///
/// [`ValuePool::get`] returns the instance already registered for an equal
/// value, or registers the given value as the canonical one. Values must be
/// immutable or otherwise safe to share.
///
/// The pool only holds weak references to the canonical instances, so an
/// entry disappears once nothing outside the pool refers to it. Slots of
/// reclaimed instances are swept during registration whenever the number of
/// buckets has doubled since the last sweep. To give
/// values a chance to be reused between holders, the most recently registered
/// instances are additionally kept alive in a bounded retention list. That
/// list can be released at any time, e.g. under memory pressure, with
/// [`ValuePool::release_retained`].
///
/// This is a cache: a value may occasionally be canonicalized twice, which
/// costs memory but never loses data.
pub struct ValuePool<T> {
	/// Canonical instances, bucketed by hash.
	slots: RwLock<HashMap<u64, Vec<Weak<T>>>>,
	/// Strong references to recently registered instances, oldest first.
	retained: Mutex<VecDeque<Arc<T>>>,
	/// Capacity of `retained`.
	retention: usize,
	/// Hasher for bucketing values.
	hasher: RandomState,
	/// Bucket count at which the next registration sweeps reclaimed slots.
	sweep_at: AtomicUsize,
	/// Number of lookups.
	refs: AtomicU64,
	/// Number of lookups which found a canonical instance.
	hits: AtomicU64,
}

impl<T> std::fmt::Debug for ValuePool<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ValuePool")
			.field("retention", &self.retention)
			.field("refs", &self.refs.load(Ordering::Relaxed))
			.field("hits", &self.hits.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

impl<T: Eq + Hash> Default for ValuePool<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Eq + Hash> ValuePool<T> {
	/// Create a pool retaining [`DEFAULT_RETENTION`] values.
	#[must_use]
	pub fn new() -> Self {
		Self::with_retention(DEFAULT_RETENTION)
	}

	/// Create a pool keeping up to `retention` recently registered values
	/// alive. With 0, entries live exactly as long as their outside holders.
	#[must_use]
	pub fn with_retention(retention: usize) -> Self {
		Self {
			slots: RwLock::new(HashMap::new()),
			retained: Mutex::new(VecDeque::with_capacity(retention.min(DEFAULT_RETENTION))),
			retention,
			hasher: RandomState::new(),
			sweep_at: AtomicUsize::new(MIN_SWEEP_THRESHOLD),
			refs: AtomicU64::new(0),
			hits: AtomicU64::new(0),
		}
	}

	/// The canonical instance for `value`.
	pub fn get(&self, value: T) -> Arc<T> {
		let hash = self.hasher.hash_one(&value);
		match self.lookup(hash, &value) {
			Some(canonical) => canonical,
			None => self.register(hash, Arc::new(value)),
		}
	}

	/// The canonical instance for an already shared `value`. If there is none
	/// yet, `value` itself becomes canonical.
	pub fn get_arc(&self, value: Arc<T>) -> Arc<T> {
		let hash = self.hasher.hash_one(&*value);
		match self.lookup(hash, &value) {
			Some(canonical) => canonical,
			None => self.register(hash, value),
		}
	}

	/// Number of live canonical instances.
	#[must_use]
	pub fn len(&self) -> usize {
		self.slots
			.read()
			.values()
			.map(|bucket| bucket.iter().filter(|slot| slot.strong_count() > 0).count())
			.sum()
	}

	/// Whether the pool holds no live instances.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Number of lookups so far.
	#[must_use]
	pub fn refs(&self) -> u64 {
		self.refs.load(Ordering::Relaxed)
	}

	/// Number of lookups that found a canonical instance.
	#[must_use]
	pub fn hits(&self) -> u64 {
		self.hits.load(Ordering::Relaxed)
	}

	/// Drop the strong references of the retention list. Instances nobody
	/// else holds are reclaimed.
	pub fn release_retained(&self) {
		let released = std::mem::take(&mut *self.retained.lock());
		debug!(count = released.len(), "Released retained pool values");
	}

	/// Remove slots of reclaimed instances. Returns how many were removed.
	pub fn purge(&self) -> usize {
		sweep(&mut self.slots.write())
	}

	/// Find a live canonical instance equal to `value`.
	fn lookup(&self, hash: u64, value: &T) -> Option<Arc<T>> {
		let refs = self.refs.fetch_add(1, Ordering::Relaxed);
		if refs % STATS_INTERVAL == 0 {
			debug!(refs, hits = self.hits.load(Ordering::Relaxed), "Value pool statistics");
		}

		let found = find(self.slots.read().get(&hash)?, value);
		if found.is_some() {
			self.hits.fetch_add(1, Ordering::Relaxed);
		}
		found
	}

	/// Register `value` as canonical, unless another caller won the race.
	fn register(&self, hash: u64, value: Arc<T>) -> Arc<T> {
		{
			let mut slots = self.slots.write();
			if slots.len() >= self.sweep_at.load(Ordering::Relaxed) {
				let removed = sweep(&mut slots);
				let next = (slots.len() * 2).max(MIN_SWEEP_THRESHOLD);
				self.sweep_at.store(next, Ordering::Relaxed);
				debug!(removed, buckets = slots.len(), "Swept reclaimed pool values");
			}
			let bucket = slots.entry(hash).or_default();
			if let Some(existing) = find(bucket, &value) {
				return existing;
			}
			bucket.retain(|slot| slot.strong_count() > 0);
			bucket.push(Arc::downgrade(&value));
		}

		if self.retention > 0 {
			let mut retained = self.retained.lock();
			if retained.len() >= self.retention {
				retained.pop_front();
			}
			retained.push_back(Arc::clone(&value));
		}
		value
	}
}

/// Remove slots of reclaimed instances, and buckets left empty. Returns how
/// many slots were removed.
fn sweep<T>(slots: &mut HashMap<u64, Vec<Weak<T>>>) -> usize {
	let mut removed = 0;
	slots.retain(|_, bucket| {
		let before = bucket.len();
		bucket.retain(|slot| slot.strong_count() > 0);
		removed += before - bucket.len();
		!bucket.is_empty()
	});
	removed
}

/// The live instance in `bucket` equal to `value`.
fn find<T: Eq>(bucket: &[Weak<T>], value: &T) -> Option<Arc<T>> {
	bucket.iter().filter_map(Weak::upgrade).find(|candidate| **candidate == *value)
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::sync::Arc;

	use super::ValuePool;

	#[test]
	fn equal_values_share_an_instance() {
		let pool = ValuePool::new();
		let a = pool.get(String::from("ou=people,dc=example,dc=org"));
		let b = pool.get(String::from("ou=people,dc=example,dc=org"));
		let c = pool.get(String::from("ou=groups,dc=example,dc=org"));

		assert!(Arc::ptr_eq(&a, &b), "Equal values should be canonicalized");
		assert!(!Arc::ptr_eq(&a, &c));
		assert_eq!(pool.len(), 2);
		assert_eq!(pool.refs(), 3);
		assert_eq!(pool.hits(), 1);
	}

	#[test]
	fn first_registered_value_is_canonical() {
		let pool = ValuePool::with_retention(0);
		let first = Arc::new(String::from("inetOrgPerson"));
		let second = Arc::new(String::from("inetOrgPerson"));

		let canonical = pool.get_arc(Arc::clone(&first));
		assert!(Arc::ptr_eq(&canonical, &first));
		assert!(Arc::ptr_eq(&pool.get_arc(second), &first));
	}

	#[test]
	fn unreferenced_values_are_reclaimed() {
		let pool = ValuePool::with_retention(0);
		let value = pool.get(42_u32);
		assert_eq!(pool.len(), 1);

		drop(value);
		assert!(pool.is_empty());
		assert_eq!(pool.purge(), 1);
		assert_eq!(pool.purge(), 0);
	}

	#[test]
	fn reclaimed_slots_are_swept_on_registration() {
		let pool = ValuePool::with_retention(0);
		let keep: Vec<_> = (0..10_u32).map(|i| pool.get(i)).collect();
		for i in 10..100_000_u32 {
			drop(pool.get(i));
		}

		let buckets = pool.slots.read().len();
		assert!(buckets < 1000, "{buckets} buckets left after dropping all values");
		assert_eq!(pool.len(), 10);
		for (i, value) in (0..10_u32).zip(&keep) {
			assert!(Arc::ptr_eq(&pool.get(i), value), "Live values survive a sweep");
		}
	}

	#[test]
	fn retention_keeps_values_until_released() {
		let pool = ValuePool::with_retention(2);
		let first = Arc::as_ptr(&pool.get(1_u32));
		assert_eq!(Arc::as_ptr(&pool.get(1_u32)), first, "Retained value is reused");

		drop(pool.get(2_u32));
		drop(pool.get(3_u32));
		assert_eq!(pool.len(), 2, "Only the two most recent values are retained");

		pool.release_retained();
		assert!(pool.is_empty());
	}

	#[test]
	fn concurrent_lookups() {
		let pool = ValuePool::with_retention(0);
		let keep = pool.get(String::from("cn"));

		std::thread::scope(|scope| {
			for _ in 0..8 {
				scope.spawn(|| {
					for _ in 0..100 {
						assert!(Arc::ptr_eq(&pool.get(String::from("cn")), &keep));
					}
				});
			}
		});
		assert_eq!(pool.hits(), 800);
	}
}
