//! The controller: wires listers, merger, workers and deferred deletions
//! together and owns the run's exit disposition.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::context::SyncContext;
use crate::object::Action;
use crate::produce::{produce_from_list, start_producer};
use crate::progress::Summary;
use crate::store::ObjectStore;
use crate::worker::{delete_obj, worker};

/// Task channel bound in standalone mode. With a remote manager dispatching
/// tasks there is no work stealing, so the channel stays (nearly) unbuffered
/// to keep load from piling up in any single worker.
const TASK_CHANNEL_BOUND: usize = 10_240;

const WATCH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Synchronize every key in the configured range from `src` to `dst`.
pub async fn sync(
    src: Arc<dyn ObjectStore>,
    dst: Arc<dyn ObjectStore>,
    config: Config,
) -> Result<Summary> {
    sync_with_context(SyncContext::new(src, dst, config)).await
}

/// Engine entry point for embedders that want access to the live counters.
pub async fn sync_with_context(ctx: Arc<SyncContext>) -> Result<Summary> {
    tracing::info!("syncing from {} to {}", ctx.src.uri(), ctx.dst.uri());
    if !ctx.config.start.is_empty() {
        tracing::info!("first key: {:?}", ctx.config.start);
    }
    if !ctx.config.end.is_empty() {
        tracing::info!("last key: {:?}", ctx.config.end);
    }

    let capacity = if ctx.config.manager.is_some() {
        1
    } else {
        TASK_CHANNEL_BOUND
    };
    let (tasks_tx, tasks_rx) = async_channel::bounded::<Action>(capacity);

    if let Some(registry) = &ctx.config.registry {
        crate::metrics::register(registry, &ctx)?;
    }

    let mut workers = JoinSet::new();
    for _ in 0..ctx.config.threads.max(1) {
        workers.spawn(worker(ctx.clone(), tasks_rx.clone()));
    }

    let pending_updater = tokio::spawn({
        let ctx = ctx.clone();
        // a receiver clone can sample the queue length without keeping the
        // channel alive the way a sender would
        let tasks_rx = tasks_rx.clone();
        async move {
            loop {
                ctx.counters
                    .pending
                    .store(tasks_rx.len() as i64, std::sync::atomic::Ordering::Relaxed);
                tokio::time::sleep(WATCH_INTERVAL).await;
            }
        }
    });

    let failure_watcher = if !ctx.config.dry && ctx.config.max_failure > 0 {
        let ctx = ctx.clone();
        Some(tokio::spawn(async move {
            loop {
                if ctx.counters.failed.get() >= ctx.config.max_failure {
                    tracing::info!(
                        "the maximum error limit of {} was reached, stop now",
                        ctx.config.max_failure
                    );
                    tracing::info!("{}", ctx.counters.summary());
                    std::process::exit(1);
                }
                tokio::time::sleep(WATCH_INTERVAL).await;
            }
        }))
    } else {
        None
    };

    let produced = if ctx.config.files_from.is_some() {
        produce_from_list(&ctx, &tasks_tx).await
    } else {
        start_producer(
            ctx.clone(),
            tasks_tx.clone(),
            String::new(),
            ctx.config.list_depth,
        )
        .await
    };
    // close the channel; pending tasks still drain even when producing failed
    drop(tasks_tx);
    while workers.join_next().await.is_some() {}
    pending_updater.abort();
    if let Some(watcher) = failure_watcher {
        watcher.abort();
    }
    ctx.counters
        .pending
        .store(0, std::sync::atomic::Ordering::Relaxed);
    produced?;

    let src_dirs = std::mem::take(&mut *ctx.src_delay_del.lock().unwrap());
    let dst_dirs = std::mem::take(&mut *ctx.dst_delay_del.lock().unwrap());
    tokio::join!(
        delayed_deletions(&ctx, &ctx.src, src_dirs),
        delayed_deletions(&ctx, &ctx.dst, dst_dirs),
    );

    let summary = ctx.counters.summary();
    tracing::info!("{}", summary);
    if summary.failed > 0 || summary.lost > 0 {
        anyhow::bail!("failed to handle {} objects", summary.failed + summary.lost);
    }
    Ok(summary)
}

/// Directories queued during the run are removed children-first, so the keys
/// are deleted in descending lexicographic order.
async fn delayed_deletions(ctx: &Arc<SyncContext>, store: &Arc<dyn ObjectStore>, mut keys: Vec<String>) {
    if keys.is_empty() {
        return;
    }
    tracing::info!("delete {} dirs from {}", keys.len(), store.uri());
    keys.sort();
    for key in keys.iter().rev() {
        ctx.counters.incr_handled(1);
        delete_obj(ctx, store, key).await;
    }
}
