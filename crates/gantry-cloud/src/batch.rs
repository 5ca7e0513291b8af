//! Bounded-concurrency listener batches
//!
//! Multi-listener operations fan out over a bounded pool and collect one
//! [`ListenerResult`] per listener name. A failed listener is recorded in
//! its own slot and never aborts the siblings.

use std::collections::HashMap;
use std::future::Future;

use futures::{StreamExt, stream};
use tracing::warn;

use gantry_api::model::{Listener, ListenerResult};
use gantry_common::Result;

/// In-flight listener operations per batch
pub const DEFAULT_BATCH_CONCURRENCY: usize = 10;

/// Run `ensure` over the listeners with at most `limit` in flight
///
/// The returned map is keyed by listener name; errors are rendered into the
/// per-listener slot.
pub async fn ensure_in_batches<F, Fut>(
    listeners: &[Listener],
    limit: usize,
    ensure: F,
) -> HashMap<String, ListenerResult>
where
    F: Fn(Listener) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    stream::iter(listeners.iter().cloned().map(|listener| {
        let name = listener.name.clone();
        let fut = ensure(listener);
        async move {
            match fut.await {
                Ok(listener_id) => (name, ListenerResult::ok(listener_id)),
                Err(err) => {
                    warn!("ensure listener '{}' failed: {}", name, err);
                    (name, ListenerResult::err(err.to_string()))
                }
            }
        }
    }))
    .buffer_unordered(limit.max(1))
    .collect()
    .await
}

/// Run `delete` over the listeners with at most `limit` in flight
pub async fn delete_in_batches<F, Fut>(
    listeners: &[Listener],
    limit: usize,
    delete: F,
) -> HashMap<String, ListenerResult>
where
    F: Fn(Listener) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    stream::iter(listeners.iter().cloned().map(|listener| {
        let name = listener.name.clone();
        let fut = delete(listener);
        async move {
            match fut.await {
                Ok(()) => (name, ListenerResult::ok(String::new())),
                Err(err) => {
                    warn!("delete listener '{}' failed: {}", name, err);
                    (name, ListenerResult::err(err.to_string()))
                }
            }
        }
    }))
    .buffer_unordered(limit.max(1))
    .collect()
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use gantry_api::model::ListenerSpec;
    use gantry_common::CloudError;

    use super::*;

    fn listeners(names: &[&str]) -> Vec<Listener> {
        names
            .iter()
            .map(|n| Listener::new(n.to_string(), "default".to_string(), ListenerSpec::default()))
            .collect()
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_batch() {
        let input = listeners(&["a", "b", "c"]);

        let results = ensure_in_batches(&input, DEFAULT_BATCH_CONCURRENCY, |listener| async move {
            if listener.name == "b" {
                Err(CloudError::Retryable("resource busy".to_string()))
            } else {
                Ok(format!("id-{}", listener.name))
            }
        })
        .await;

        assert_eq!(results.len(), 3);
        assert!(!results["a"].is_error);
        assert_eq!(results["a"].listener_id, "id-a");
        assert!(results["b"].is_error);
        assert!(results["b"].message.contains("resource busy"));
        assert!(!results["c"].is_error);
    }

    #[tokio::test]
    async fn test_concurrency_stays_bounded() {
        let input = listeners(&["a", "b", "c", "d", "e", "f"]);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = ensure_in_batches(&input, 2, |listener| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(listener.name)
            }
        })
        .await;

        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_delete_batch_reports_empty_ids() {
        let input = listeners(&["a", "b"]);

        let results = delete_in_batches(&input, DEFAULT_BATCH_CONCURRENCY, |listener| async move {
            if listener.name == "a" {
                Ok(())
            } else {
                Err(CloudError::Network("connection reset".to_string()))
            }
        })
        .await;

        assert!(!results["a"].is_error);
        assert!(results["a"].listener_id.is_empty());
        assert!(results["b"].is_error);
    }
}
