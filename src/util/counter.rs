use std::sync::Mutex;

/// Monotonically increasing transaction-id source.
///
/// The one piece of session state that is shared between call sites, so it
/// is the one place that carries a lock.
#[derive(Debug)]
pub struct SynchronizedCounter {
    next: Mutex<u64>,
}

impl SynchronizedCounter {
    pub fn new(first: u64) -> SynchronizedCounter {
        SynchronizedCounter {
            next: Mutex::new(first),
        }
    }

    pub fn next(&self) -> u64 {
        let mut guard = self.next.lock().expect("transaction counter mutex poisoned");
        let value = *guard;
        *guard += 1;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_monotonic() {
        let counter = SynchronizedCounter::new(7);
        assert_eq!(counter.next(), 7);
        assert_eq!(counter.next(), 8);
        assert_eq!(counter.next(), 9);
    }

    #[test]
    fn test_no_duplicates_across_threads() {
        let counter = Arc::new(SynchronizedCounter::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| counter.next()).collect::<Vec<_>>()
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
    }
}
