use parking_lot::RwLock;
use std::sync::Arc;

/// État partagé entre tâches : lu souvent, écrit rarement
pub type SharedRw<T> = Arc<RwLock<T>>;

pub fn new_rw_state<T>(value: T) -> SharedRw<T> {
    Arc::new(RwLock::new(value))
}
