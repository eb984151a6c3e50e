use crate::{StoreError, StoreResult};
use std::future::Future;
use tracing::warn;

/// Run `op`, re-running it once if the first attempt hit a conflict.
///
/// A second conflict is returned to the caller.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    match op().await {
        Err(StoreError::Conflict(reason)) => {
            warn!(operation = what, %reason, "store conflict, retrying once");
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_exactly_once() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: StoreResult<()> = retry_on_conflict("test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Conflict("busy".into()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_attempt_can_succeed() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result = retry_on_conflict("test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Conflict("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: StoreResult<()> = retry_on_conflict("test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound("x".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
