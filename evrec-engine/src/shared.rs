// Shared handles to the engine's state tables.
//
// Lock poisoning is recovered rather than propagated: every table update is
// a single in-place mutation, so a panicking writer cannot leave a row
// half-written.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::aggregator::SimilarityAggregator;
use crate::history::InteractionHistory;
use crate::similarity_store::SimilarityStore;

pub type SharedStore = Arc<RwLock<SimilarityStore>>;
pub type SharedHistory = Arc<RwLock<InteractionHistory>>;
pub type SharedAggregator = Arc<Mutex<SimilarityAggregator>>;

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
	lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
	lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
