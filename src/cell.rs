//! Shared mutable state for handlers.

use std::sync::{Arc, Mutex, MutexGuard};

/// A value shared between handlers across worker threads, carrying its own
/// lock. Handlers capture a clone; every access goes through the lock.
///
/// # Example
/// ```
/// use petrel::SharedCell;
///
/// let counter = SharedCell::new(0_u64);
/// let for_handler = counter.clone();
/// for_handler.update(|count| *count += 1);
/// assert_eq!(counter.get(), 1);
/// ```
pub struct SharedCell<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> SharedCell<T> {
    pub fn new(value: T) -> SharedCell<T> {
        SharedCell {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.lock().clone()
    }

    pub fn set(&self, value: T) {
        *self.lock() = value;
    }

    /// Runs `f` under the lock and returns its result.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }
}

impl<T> Clone for SharedCell<T> {
    fn clone(&self) -> Self {
        SharedCell {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Default> Default for SharedCell<T> {
    fn default() -> Self {
        SharedCell::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_value() {
        let cell = SharedCell::new(vec![1, 2]);
        let other = cell.clone();
        other.update(|values| values.push(3));
        assert_eq!(cell.get(), [1, 2, 3]);

        cell.set(Vec::new());
        assert!(other.get().is_empty());
    }
}
