//! Bounded fan-out with panic containment and error aggregation.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// Every failure message of a batch, joined by newlines when displayed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .messages.join("\n"))]
pub struct AggregateError {
    pub label: String,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParallelExecutor {
    label: String,
}

impl ParallelExecutor {
    /// `label` names the batch in logs, metrics and panic reports.
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }

    /// Run `task(0..max_tasks)` with at most `parallelism` in flight.
    ///
    /// Admission stops once any task has failed; tasks already admitted still
    /// run to completion. A panicking task is reported as an error.
    pub async fn run<F, Fut, E>(&self, max_tasks: usize, parallelism: usize, task: F) -> Result<(), AggregateError>
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if max_tasks == 0 {
            return Ok(());
        }
        let t0 = std::time::Instant::now();
        let task = Arc::new(task);
        let permits = Arc::new(Semaphore::new(parallelism.max(1)));
        let failures = Arc::new(AtomicUsize::new(0));
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<String>();

        // single consumer for every failure message
        let collector = tokio::spawn(async move {
            let mut messages = Vec::new();
            while let Some(m) = err_rx.recv().await {
                messages.push(m);
            }
            messages
        });

        let mut handles = Vec::with_capacity(max_tasks);
        let mut dispatched = 0usize;
        for index in 0..max_tasks {
            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            if failures.load(Ordering::SeqCst) > 0 {
                debug!(label = %self.label, index, "parallel: admission stopped after failure");
                break;
            }
            let task = task.clone();
            let failures = failures.clone();
            let err_tx = err_tx.clone();
            let label = self.label.clone();
            dispatched += 1;
            handles.push(tokio::spawn(async move {
                let outcome = AssertUnwindSafe(async { (*task)(index).await }).catch_unwind().await;
                let message = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(payload) => {
                        counter!("parallel_task_panics_total", 1u64);
                        let msg = panic_message(&label, index, payload.as_ref());
                        warn!(label = %label, index, "parallel: task panicked");
                        Some(msg)
                    }
                };
                if let Some(m) = message {
                    failures.fetch_add(1, Ordering::SeqCst);
                    let _ = err_tx.send(m);
                }
                drop(permit);
            }));
        }
        drop(err_tx);

        let mut lost = Vec::new();
        for (index, h) in handles.into_iter().enumerate() {
            if let Err(e) = h.await {
                lost.push(format!("{}[{}]: task aborted: {}", self.label, index, e));
            }
        }
        let mut messages = collector.await.unwrap_or_default();
        messages.extend(lost);

        counter!("parallel_tasks_total", dispatched as u64);
        histogram!("parallel_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(label = %self.label, total = max_tasks, dispatched, failed = messages.len(), took_ms = %t0.elapsed().as_millis(), "parallel: batch done");

        if messages.is_empty() {
            Ok(())
        } else {
            Err(AggregateError { label: self.label.clone(), messages })
        }
    }
}

fn panic_message(label: &str, index: usize, payload: &(dyn std::any::Any + Send)) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!(
        "panic in {label}[{index}]: {msg}\nstack:\n  0: {label} task {index}\n  1: {}::ParallelExecutor::run\n  2: tokio::task::spawn",
        module_path!()
    )
}
