//! Fail-fast fan-out over scoped worker threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Apply `f` to every item, preserving order, on up to `workers` threads.
///
/// The first failure raises a shared cancel flag; workers check it before
/// each item, so siblings stop early and exactly one error is returned.
/// No partial output escapes on failure.
pub(crate) fn try_map<T, U, E, F>(items: &[T], workers: usize, f: F) -> Result<Vec<U>, E>
where
    T: Sync,
    U: Send,
    E: Send,
    F: Fn(&T) -> Result<U, E> + Sync,
{
    if workers <= 1 || items.len() <= 1 {
        return items.iter().map(&f).collect();
    }

    let cancelled = AtomicBool::new(false);
    let chunk_size = items.len().div_ceil(workers);

    thread::scope(|scope| {
        let handles: Vec<_> = items
            .chunks(chunk_size)
            .map(|chunk| {
                let f = &f;
                let cancelled = &cancelled;
                scope.spawn(move || -> Option<Result<Vec<U>, E>> {
                    let mut out = Vec::with_capacity(chunk.len());
                    for item in chunk {
                        if cancelled.load(Ordering::Acquire) {
                            return None;
                        }
                        match f(item) {
                            Ok(value) => out.push(value),
                            Err(e) => {
                                cancelled.store(true, Ordering::Release);
                                return Some(Err(e));
                            }
                        }
                    }
                    Some(Ok(out))
                })
            })
            .collect();

        let mut merged = Vec::with_capacity(items.len());
        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Some(Ok(part))) => merged.extend(part),
                Ok(Some(Err(e))) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                // Cancelled: some other worker recorded the error
                Ok(None) => {}
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(merged),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_preserves_order() {
        let items: Vec<u32> = (0..1000).collect();
        let doubled: Result<Vec<u32>, ()> = try_map(&items, 4, |x| Ok(x * 2));
        assert_eq!(doubled.unwrap(), items.iter().map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_worker_path() {
        let items = vec![1, 2, 3];
        let result: Result<Vec<i32>, ()> = try_map(&items, 1, |x| Ok(x + 1));
        assert_eq!(result.unwrap(), vec![2, 3, 4]);
    }

    #[test]
    fn test_failure_returns_one_error() {
        let items: Vec<u32> = (0..10_000).collect();
        let result: Result<Vec<u32>, String> = try_map(&items, 4, |x| {
            if *x == 10 || *x == 9_000 {
                Err(format!("bad item {}", x))
            } else {
                Ok(*x)
            }
        });
        let err = result.unwrap_err();
        assert!(err == "bad item 10" || err == "bad item 9000");
    }

    #[test]
    fn test_failing_chunk_stops_early() {
        let items: Vec<u32> = (0..1000).collect();
        let processed = AtomicUsize::new(0);
        // Single chunk per worker; the first item of the first chunk fails
        let result: Result<Vec<u32>, ()> = try_map(&items, 2, |x| {
            processed.fetch_add(1, Ordering::Relaxed);
            if *x == 0 {
                Err(())
            } else {
                Ok(*x)
            }
        });
        assert!(result.is_err());
        // The failing worker never touched the rest of its 500-item chunk
        assert!(processed.load(Ordering::Relaxed) <= 501);
    }
}
