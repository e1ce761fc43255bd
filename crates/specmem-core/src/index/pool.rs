//! Bounded worker pool
//!
//! `concurrency` workers share one atomic cursor over the input slice and
//! each pulls the next item until the slice is exhausted or the run is
//! cancelled.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

/// Run `work` over `items` with at most `concurrency` in flight.
///
/// The result lines up with `items`; an entry is `None` when the item was
/// never started because the run was cancelled.
pub async fn run_pool<'a, T, R, F, Fut>(
    items: &'a [T],
    concurrency: usize,
    cancel: &CancellationToken,
    work: F,
) -> Vec<Option<R>>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = R>,
{
    let next = &AtomicUsize::new(0);
    let work = &work;
    let workers = concurrency.clamp(1, items.len().max(1));

    let worker = move || async move {
        let mut done = Vec::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let idx = next.fetch_add(1, Ordering::Relaxed);
            let Some(item) = items.get(idx) else {
                break;
            };
            done.push((idx, work(item).await));
        }
        done
    };

    let mut results: Vec<Option<R>> = std::iter::repeat_with(|| None).take(items.len()).collect();
    for (idx, result) in join_all((0..workers).map(|_| worker())).await.into_iter().flatten() {
        results[idx] = Some(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_line_up_with_input() {
        let items: Vec<u32> = (0..50).collect();
        let token = CancellationToken::new();
        let out = run_pool(&items, 4, &token, |n| async move {
            tokio::time::sleep(Duration::from_millis((50 - *n as u64) % 7)).await;
            n * 2
        })
        .await;
        let expected: Vec<Option<u32>> = items.iter().map(|n| Some(n * 2)).collect();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let items = vec![(); 40];
        let token = CancellationToken::new();
        let in_flight = &AtomicUsize::new(0);
        let peak = &AtomicUsize::new(0);

        run_pool(&items, 3, &token, |_| async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_work() {
        let items: Vec<usize> = (0..20).collect();
        let token = CancellationToken::new();
        let out = run_pool(&items, 2, &token, |n| {
            let token = token.clone();
            async move {
                if *n == 3 {
                    token.cancel();
                }
                *n
            }
        })
        .await;

        assert!(out.iter().filter(|r| r.is_some()).count() < items.len());
        assert_eq!(out[3], Some(3));
        assert!(out[19].is_none());
    }

    #[tokio::test]
    async fn test_empty_input() {
        let items: Vec<u8> = Vec::new();
        let out = run_pool(&items, 8, &CancellationToken::new(), |n| async move { *n }).await;
        assert!(out.is_empty());
    }
}
