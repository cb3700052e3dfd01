use parking_lot::RwLock;
use std::sync::Arc;

/// État partagé lecteurs/écrivain, verrou tenu le temps d'une copie
pub type Shared<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}
