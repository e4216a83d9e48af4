// ---------------------------------------------------------------------------
// Keyed async locks
// ---------------------------------------------------------------------------
//
// Serializes writers per key (a Top-K subject, a recompute target) while
// leaving different keys fully concurrent. Guards are owned so they can be
// held across `.await` points and moved into spawned jobs.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Idle entries are swept once the table grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

pub struct KeyedMutex<K> {
	slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedMutex<K> {
	fn default() -> Self {
		Self {
			slots: Mutex::new(HashMap::new()),
		}
	}
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
	pub fn new() -> Self {
		Self::default()
	}

	fn slot(&self, key: &K) -> Arc<AsyncMutex<()>> {
		let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
		if slots.len() > PRUNE_THRESHOLD {
			slots.retain(|_, m| Arc::strong_count(m) > 1);
		}
		slots
			.entry(key.clone())
			.or_insert_with(|| Arc::new(AsyncMutex::new(())))
			.clone()
	}

	/// Wait for exclusive access to `key`.
	pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
		self.slot(key).lock_owned().await
	}

	/// Exclusive access to `key` if nobody holds it right now.
	pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<()>> {
		self.slot(key).try_lock_owned().ok()
	}

	pub fn len(&self) -> usize {
		self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	#[tokio::test]
	async fn same_key_is_exclusive() {
		let locks = KeyedMutex::new();
		let guard = locks.lock(&1u64).await;
		assert!(locks.try_lock(&1u64).is_none());
		assert!(locks.try_lock(&2u64).is_some());
		drop(guard);
		assert!(locks.try_lock(&1u64).is_some());
	}

	#[tokio::test]
	async fn writers_on_one_key_never_overlap() {
		let locks = Arc::new(KeyedMutex::new());
		let active = Arc::new(AtomicUsize::new(0));
		let peak = Arc::new(AtomicUsize::new(0));
		let mut handles = Vec::new();
		for _ in 0..8 {
			let locks = locks.clone();
			let active = active.clone();
			let peak = peak.clone();
			handles.push(tokio::spawn(async move {
				let _guard = locks.lock(&"subject").await;
				let now = active.fetch_add(1, Ordering::SeqCst) + 1;
				peak.fetch_max(now, Ordering::SeqCst);
				tokio::time::sleep(Duration::from_millis(2)).await;
				active.fetch_sub(1, Ordering::SeqCst);
			}));
		}
		for h in handles {
			h.await.unwrap();
		}
		assert_eq!(peak.load(Ordering::SeqCst), 1);
	}
}
