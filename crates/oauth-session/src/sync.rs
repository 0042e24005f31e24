//! Poison-tolerant locking for short, non-async critical sections

use std::sync::{Mutex, MutexGuard};

pub(crate) trait MutexExt<T> {
    /// Lock, recovering the data if a previous holder panicked.
    fn lock_or_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[track_caller]
    fn lock_or_recover(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                let loc = std::panic::Location::caller();
                tracing::error!(
                    mutex_type = std::any::type_name::<T>(),
                    file = loc.file(),
                    line = loc.line(),
                    "mutex poisoned, recovering inner state"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn recovers_after_panic() {
        let mutex = Arc::new(Mutex::new(Vec::<u8>::new()));
        let clone = Arc::clone(&mutex);

        let _ = std::thread::spawn(move || {
            let mut guard = clone.lock().unwrap();
            guard.push(1);
            panic!("poison the lock");
        })
        .join();

        assert_eq!(*mutex.lock_or_recover(), vec![1]);
    }
}
