//! Bounded-parallelism map over an index range.
//!
//! Results land in a pre-sized slot vector at their input index, so output
//! order matches input order regardless of completion order. A feeder pushes
//! indices into a bounded queue shared by a fixed number of workers; the call
//! returns only after the feeder and every worker have finished.

use std::future::Future;
use std::sync::Mutex;

use dockwatch_core::config::MAX_CONCURRENCY;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::WatcherError;

/// Clamps a requested worker count to `[1, MAX_CONCURRENCY]`, using
/// `default` when the request is zero.
pub fn clamp_concurrency(requested: usize, default: usize) -> usize {
    let n = if requested == 0 { default } else { requested };
    n.clamp(1, MAX_CONCURRENCY)
}

/// Calls `f(i)` for every `i` in `0..len` with at most `concurrency` calls
/// in flight, returning the results in index order.
///
/// # Errors
///
/// `WatcherError::Cancelled` if `cancel` fires before every item finished.
/// Items already in flight are dropped at their next await point.
pub async fn map_ordered<R, F, Fut>(
    cancel: &CancellationToken,
    len: usize,
    concurrency: usize,
    f: F,
) -> Result<Vec<R>, WatcherError>
where
    R: Send,
    F: Fn(usize) -> Fut + Sync,
    Fut: Future<Output = R> + Send,
{
    if len == 0 {
        return Ok(Vec::new());
    }
    let workers = clamp_concurrency(concurrency, 1).min(len);

    let slots: Mutex<Vec<Option<R>>> = Mutex::new((0..len).map(|_| None).collect());
    let (tx, rx) = mpsc::channel::<usize>(workers);
    let queue = tokio::sync::Mutex::new(rx);

    let feeder = async move {
        for index in 0..len {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(index) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let (queue, slots_ref, f) = (&queue, &slots, &f);
    let pool = (0..workers).map(|_| async move {
        loop {
            let next = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    index = rx.recv() => index,
                }
            };
            let Some(index) = next else {
                break;
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = f(index) => r,
            };
            slots_ref.lock().unwrap_or_else(|p| p.into_inner())[index] = Some(result);
        }
    });

    tokio::join!(feeder, join_all(pool));

    slots
        .into_inner()
        .unwrap_or_else(|p| p.into_inner())
        .into_iter()
        .collect::<Option<Vec<R>>>()
        .ok_or(WatcherError::Cancelled)
}
