use std::future::Future;

use log::{debug, error};
use tokio::task::JoinHandle;

/// Spawn a named background task. The name shows up in logs so runaway or
/// crashed loops can be traced back to their owner.
pub fn spawn_task<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!("task '{}' started", name);
        future.await;
        debug!("task '{}' finished", name);
    })
}

/// Spawn a named task from a fallible future; an `Err` outcome is logged
/// rather than propagated so background loops never take the process down.
pub fn spawn_fallible_task<F, E>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display,
{
    tokio::spawn(async move {
        debug!("task '{}' started", name);
        if let Err(e) = future.await {
            error!("task '{}' failed: {}", name, e);
        }
        debug!("task '{}' finished", name);
    })
}
