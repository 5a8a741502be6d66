//! Bounded worker pool over a slice of jobs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

/// Run `f` over every item on at most `workers` threads.
///
/// Workers pull the next index from a shared counter until the slice is
/// drained. Results come back in input order regardless of completion order.
pub fn run_pool<T, R, F>(workers: usize, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = workers.clamp(1, items.len());
    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<R>>> = Mutex::new((0..items.len()).map(|_| None).collect());

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(index) else {
                    break;
                };
                let result = f(item);
                let mut slots = slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                slots[index] = Some(result);
            });
        }
    });

    slots
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_preserves_order() {
        let items: Vec<u64> = (0..20).collect();
        let results = run_pool(4, &items, |n| {
            thread::sleep(Duration::from_millis(20 - n));
            n * 2
        });
        assert_eq!(results, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded_parallelism() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items = vec![(); 12];

        run_pool(3, &items, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            active.fetch_sub(1, Ordering::SeqCst);
        });

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak {}", peak);
        assert!(peak >= 2, "peak {}", peak);
    }

    #[test]
    fn test_empty_and_zero_workers() {
        let none: Vec<u8> = Vec::new();
        assert!(run_pool(4, &none, |n| *n).is_empty());
        assert_eq!(run_pool(0, &[1, 2, 3], |n| n + 1), vec![2, 3, 4]);
    }
}
