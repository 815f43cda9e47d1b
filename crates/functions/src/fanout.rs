use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use kassert_core::FnError;
use kassert_ops::ParallelExecutor;

/// Split a comma-separated cluster list; tokens trimmed, empties dropped.
pub fn split_clusters(clusters: &str) -> Vec<String> {
    clusters.split(',').map(str::trim).filter(|c| !c.is_empty()).map(str::to_string).collect()
}

/// Run `task` once per cluster, all at once, and return the results in
/// cluster order. Any failure fails the whole call with every message joined.
pub(crate) async fn per_cluster<T, F, Fut>(label: &str, clusters: &[String], task: F) -> Result<Vec<T>, FnError>
where
    T: Send + 'static,
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FnError>> + Send + 'static,
{
    per_index(label, clusters.to_vec(), task).await
}

/// Same as [`per_cluster`] over arbitrary items.
pub(crate) async fn per_index<I, T, F, Fut>(label: &str, items: Vec<I>, task: F) -> Result<Vec<T>, FnError>
where
    I: Clone + Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FnError>> + Send + 'static,
{
    let n = items.len();
    let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new((0..n).map(|_| None).collect()));
    let items = Arc::new(items);
    let out = slots.clone();
    ParallelExecutor::new(label)
        .run(n, n, move |i| {
            let fut = task(items[i].clone());
            let slots = out.clone();
            async move {
                let value = fut.await?;
                slots.lock().unwrap_or_else(PoisonError::into_inner)[i] = Some(value);
                Ok::<(), FnError>(())
            }
        })
        .await
        .map_err(|e| FnError::Aggregate(e.to_string()))?;
    let results = std::mem::take(&mut *slots.lock().unwrap_or_else(PoisonError::into_inner));
    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_trims_and_drops_empty() {
        assert_eq!(split_clusters(" a, b ,,c,"), vec!["a", "b", "c"]);
        assert!(split_clusters("").is_empty());
    }

    #[tokio::test]
    async fn results_keep_cluster_order() {
        let clusters = split_clusters("a,b,c");
        let out = per_cluster("t", &clusters, |c| async move {
            if c == "a" {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            Ok::<_, FnError>(c.to_uppercase())
        })
        .await
        .unwrap();
        assert_eq!(out, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn failures_are_aggregated() {
        let clusters = split_clusters("a,b,c");
        let err = per_cluster("t", &clusters, |c| async move {
            if c == "a" {
                Ok(())
            } else {
                Err(FnError::in_cluster(c, FnError::NilConfig))
            }
        })
        .await
        .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("cluster: b, err: rest config is nil"));
        assert!(text.contains("cluster: c, err: rest config is nil"));
    }
}
