//! Per-device fan-out with aggregated error reporting (§4.5 "Parallelism",
//! §9 "Thread pool with error aggregation"). Grounded on the workspace's own
//! `JoinSet`-based task-monitor pattern, adapted here to gather results
//! instead of propagating a panic: the host façade needs every device's
//! outcome, not just the first failure.

use tokio::task::JoinSet;
use tracing::{error, instrument};
use vsearch_common::{Error, Result};

/// Runs one future per item concurrently on the current Tokio runtime and
/// waits for all of them, in the order results complete (not input order).
/// On return, every task has either produced an `Ok` or been folded into a
/// single [`Error::Aggregate`] via [`Error::aggregate`] — partial success
/// across devices is not surfaced to the caller (§7 "Policy").
#[instrument(skip(items, f), fields(fan_out = items.len()))]
pub async fn call_parallel<T, F, Fut, R>(items: Vec<T>, f: F) -> Result<Vec<R>>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<R>> + Send + 'static,
    R: Send + 'static,
{
    if items.len() == 1 {
        // No pool needed for the single-device case; avoids a spurious
        // `JoinSet` round trip on the overwhelmingly common configuration.
        let only = items.into_iter().next().unwrap();
        return f(only).await.map(|r| vec![r]);
    }

    let mut tasks = JoinSet::new();
    for item in items {
        let fut = f(item);
        tasks.spawn(fut);
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(r) => r,
            Err(join_err) => Err(Error::device(format!("device worker panicked: {join_err}"))),
        };
        results.push(result);
    }

    let aggregated = Error::aggregate(results);
    if let Err(ref e) = aggregated {
        error!(error = %e, "fan-out had failing workers");
    }
    aggregated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_item_skips_join_set() {
        let out = call_parallel(vec![5u32], |x| async move { Ok::<_, Error>(x * 2) })
            .await
            .unwrap();
        assert_eq!(out, vec![10]);
    }

    #[tokio::test]
    async fn all_succeed_returns_all_results() {
        let out = call_parallel(vec![1u32, 2, 3], |x| async move { Ok::<_, Error>(x * 10) })
            .await
            .unwrap();
        let mut sorted = out;
        sorted.sort();
        assert_eq!(sorted, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn one_failure_aggregates() {
        let err = call_parallel(vec![1u32, 2, 3], |x| async move {
            if x == 2 {
                Err(Error::device("boom"))
            } else {
                Ok(x)
            }
        })
        .await
        .unwrap_err();
        match err {
            Error::Aggregate { failed, total, .. } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected Aggregate, got {other:?}"),
        }
    }
}
