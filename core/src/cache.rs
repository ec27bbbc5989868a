use std::{
	collections::{HashMap, VecDeque},
	fmt,
	hash::Hash,
	time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

struct Slot<V> {
	inserted_at: Instant,
	generation: u64,
	value: V,
}

/// Slots plus the order they were written in. An order record whose generation no longer matches
/// its slot is stale and skipped.
struct Slots<K, V> {
	map: HashMap<K, Slot<V>>,
	order: VecDeque<(K, u64)>,
	generation: u64,
}

impl<K: Eq + Hash + Clone, V> Slots<K, V> {
	fn new() -> Self {
		Self {
			map: HashMap::new(),
			order: VecDeque::new(),
			generation: 0,
		}
	}

	/// Drops the least recently written slot, expired ones being the oldest anyway.
	fn evict_oldest(&mut self) {
		while let Some((key, generation)) = self.order.pop_front() {
			if self
				.map
				.get(&key)
				.is_some_and(|slot| slot.generation == generation)
			{
				self.map.remove(&key);
				return;
			}
		}
	}

	fn insert(&mut self, key: K, value: V, capacity: usize) {
		self.generation += 1;
		self.order.push_back((key.clone(), self.generation));
		self.map.insert(
			key,
			Slot {
				inserted_at: Instant::now(),
				generation: self.generation,
				value,
			},
		);

		// Stale records pile up on rewrites and invalidations
		if self.order.len() > capacity.saturating_mul(2) {
			let map = &self.map;
			self.order.retain(|(key, generation)| {
				map.get(key)
					.is_some_and(|slot| slot.generation == *generation)
			});
		}
	}
}

/// A bounded map whose entries expire after a fixed time-to-live.
///
/// Expiry is measured with [`tokio::time::Instant`], so paused test runtimes control it. When
/// the cache is full the least recently written entry makes room, in amortised constant time.
pub struct TtlCache<K, V> {
	ttl: Duration,
	capacity: usize,
	slots: Mutex<Slots<K, V>>,
}

impl<K, V> fmt::Debug for TtlCache<K, V> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TtlCache")
			.field("ttl", &self.ttl)
			.field("capacity", &self.capacity)
			.finish_non_exhaustive()
	}
}

impl<K, V> TtlCache<K, V>
where
	K: Eq + Hash + Clone + Send,
	V: Clone + Send,
{
	#[must_use]
	pub fn new(ttl: Duration, capacity: usize) -> Self {
		Self {
			ttl,
			capacity: capacity.max(1),
			slots: Mutex::new(Slots::new()),
		}
	}

	#[must_use]
	pub const fn ttl(&self) -> Duration {
		self.ttl
	}

	/// A fresh value, expired ones are evicted on the way.
	pub async fn get(&self, key: &K) -> Option<V> {
		let mut slots = self.slots.lock().await;

		match slots.map.get(key) {
			Some(slot) if slot.inserted_at.elapsed() < self.ttl => Some(slot.value.clone()),
			Some(_) => {
				slots.map.remove(key);
				None
			}
			None => None,
		}
	}

	pub async fn set(&self, key: K, value: V) {
		if self.ttl.is_zero() {
			return;
		}

		let mut slots = self.slots.lock().await;

		if !slots.map.contains_key(&key) && slots.map.len() >= self.capacity {
			slots.evict_oldest();
		}

		slots.insert(key, value, self.capacity);
	}

	/// Returns whether the key was cached.
	pub async fn invalidate(&self, key: &K) -> bool {
		self.slots.lock().await.map.remove(key).is_some()
	}

	/// Drops every key matching `predicate`, returning how many were dropped.
	pub async fn invalidate_where(&self, predicate: impl Fn(&K) -> bool + Send) -> usize {
		let mut slots = self.slots.lock().await;
		let before = slots.map.len();
		slots.map.retain(|key, _| !predicate(key));
		before - slots.map.len()
	}

	pub async fn clear(&self) {
		let mut slots = self.slots.lock().await;
		slots.map.clear();
		slots.order.clear();
	}

	pub async fn len(&self) -> usize {
		self.slots.lock().await.map.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.slots.lock().await.map.is_empty()
	}
}
