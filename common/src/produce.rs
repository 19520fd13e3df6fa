//! Producers: the dual-stream diff merger, the recursive prefix fan-out, and
//! the FilesFrom driver.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_recursion::async_recursion;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::checksum::{DEFAULT_PART_SIZE, MAX_BLOCK};
use crate::context::SyncContext;
use crate::filter::filter_stream;
use crate::listing::{list_all, MAX_RESULTS};
use crate::object::{Action, ObjectEntry};
use crate::retry::{is_marker, is_not_found, SyncError};
use crate::rules::match_leveled_path;
use crate::store::{scheme_of, ObjectStore};
use crate::worker::need_copy_perms;

pub(crate) type TaskSender = async_channel::Sender<Action>;

/// The named key is a directory; the caller should list it as a prefix.
#[derive(Debug, thiserror::Error)]
#[error("ignore dir")]
pub(crate) struct IgnoreDir;

/// Skips are frequent and cheap, so their counters are flushed in batches.
struct SkipBatch<'a> {
    ctx: &'a SyncContext,
    skip: u64,
    bytes: u64,
    last_flush: std::time::Instant,
}

impl<'a> SkipBatch<'a> {
    fn new(ctx: &'a SyncContext) -> Self {
        Self {
            ctx,
            skip: 0,
            bytes: 0,
            last_flush: std::time::Instant::now(),
        }
    }

    fn skip(&mut self, obj: &ObjectEntry) {
        self.skip += 1;
        self.bytes += obj.size;
        if self.skip > 100 || self.last_flush.elapsed() > std::time::Duration::from_millis(100) {
            self.last_flush = std::time::Instant::now();
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.skip == 0 && self.bytes == 0 {
            return;
        }
        self.ctx.counters.skipped.add(self.skip);
        self.ctx.counters.skipped_bytes.add(self.bytes);
        self.ctx.counters.incr_handled(self.skip);
        self.skip = 0;
        self.bytes = 0;
    }
}

/// An extraneous destination key: counted, and either ignored or queued for
/// deletion. Returns true when the entry budget ran out.
async fn handle_extra_object(
    ctx: &Arc<SyncContext>,
    tasks: &TaskSender,
    dstobj: ObjectEntry,
) -> Result<bool> {
    ctx.counters.incr_total(1);
    ctx.counters.extra.inc();
    ctx.counters.extra_bytes.add(dstobj.size);
    let config = &ctx.config;
    if !config.delete_dst || (!config.dirs && dstobj.is_dir) || ctx.limit_exhausted() {
        tracing::debug!("ignore extra object {}", dstobj.key);
        return Ok(false);
    }
    ctx.limit_take();
    if dstobj.is_dir {
        // children must go first; queue for the reverse-order pass
        ctx.defer_delete_dst(&dstobj.key);
    } else {
        tasks
            .send(Action::DeleteDst(dstobj))
            .await
            .context("task channel closed")?;
    }
    Ok(ctx.limit_exhausted())
}

/// Merge two sorted streams and emit one decision per key.
pub(crate) async fn produce(
    ctx: &Arc<SyncContext>,
    tasks: &TaskSender,
    srckeys: mpsc::Receiver<Result<ObjectEntry>>,
    dstkeys: mpsc::Receiver<Result<ObjectEntry>>,
) -> Result<()> {
    let mut srckeys = filter_stream(ctx.clone(), srckeys);
    let mut dstkeys = filter_stream(ctx.clone(), dstkeys);
    let mut batch = SkipBatch::new(ctx);
    let res = produce_inner(ctx, tasks, &mut srckeys, &mut dstkeys, &mut batch).await;
    batch.flush();
    res
}

async fn produce_inner(
    ctx: &Arc<SyncContext>,
    tasks: &TaskSender,
    srckeys: &mut mpsc::Receiver<Result<ObjectEntry>>,
    dstkeys: &mut mpsc::Receiver<Result<ObjectEntry>>,
    batch: &mut SkipBatch<'_>,
) -> Result<()> {
    let config = &ctx.config;
    let stream_failed = || anyhow!("listing failed, stop syncing, waiting for pending ones");
    let mut dstobj: Option<ObjectEntry> = None;
    while let Some(res) = srckeys.recv().await {
        let obj = res.map_err(|_| stream_failed())?;
        if !config.dirs && obj.is_dir {
            tracing::debug!("ignore directory {}", obj.key);
            continue;
        }
        if !ctx.limit_take() {
            return Ok(());
        }
        ctx.counters.incr_total(1);

        if let Some(d) = &dstobj {
            if obj.key > d.key {
                let d = dstobj.take().unwrap();
                if handle_extra_object(ctx, tasks, d).await? {
                    return Ok(());
                }
            }
        }
        if dstobj.is_none() {
            while let Some(dres) = dstkeys.recv().await {
                let d = dres.map_err(|_| stream_failed())?;
                if obj.key <= d.key {
                    dstobj = Some(d);
                    break;
                }
                if handle_extra_object(ctx, tasks, d).await? {
                    return Ok(());
                }
            }
        }

        let same_key = dstobj
            .as_ref()
            .map(|d| d.key == obj.key)
            .unwrap_or(false);
        if !same_key {
            // nothing on the destination at this key
            if config.existing {
                batch.skip(&obj);
                continue;
            }
            tasks
                .send(Action::Copy(obj))
                .await
                .context("task channel closed")?;
        } else {
            let d = dstobj.take().unwrap();
            if config.ignore_existing {
                batch.skip(&obj);
                continue;
            }
            if config.force_update
                || (config.update && obj.mtime_unix() > d.mtime_unix())
                || (!config.update && obj.size != d.size)
            {
                tasks
                    .send(Action::Copy(obj))
                    .await
                    .context("task channel closed")?;
            } else if config.update && obj.mtime_unix() < d.mtime_unix() {
                batch.skip(&obj);
            } else if config.check_all {
                // the two objects are likely the same; let a worker prove it
                tasks
                    .send(Action::Checksum(obj))
                    .await
                    .context("task channel closed")?;
            } else if config.delete_src {
                if obj.is_dir {
                    ctx.defer_delete_src(&obj.key);
                } else {
                    tasks
                        .send(Action::DeleteSrc(obj))
                        .await
                        .context("task channel closed")?;
                }
            } else if config.perms && need_copy_perms(&obj, &d) {
                tasks
                    .send(Action::CopyPerms(obj))
                    .await
                    .context("task channel closed")?;
            } else {
                batch.skip(&obj);
            }
        }
    }
    if config.delete_dst {
        if let Some(d) = dstobj.take() {
            if handle_extra_object(ctx, tasks, d).await? {
                return Ok(());
            }
        }
        while let Some(dres) = dstkeys.recv().await {
            let d = dres.map_err(|_| stream_failed())?;
            if handle_extra_object(ctx, tasks, d).await? {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Flat listing of both sides over the configured key range.
pub(crate) async fn single_producer(
    ctx: &Arc<SyncContext>,
    tasks: &TaskSender,
    prefix: &str,
) -> Result<()> {
    let config = &ctx.config;
    tracing::debug!(
        "max_results: {}, default_part_size: {}, max_block: {}",
        MAX_RESULTS,
        DEFAULT_PART_SIZE,
        MAX_BLOCK
    );
    let srckeys = list_all(
        ctx.src.clone(),
        prefix,
        &config.start,
        &config.end,
        !config.links,
    )
    .await
    .with_context(|| format!("list {}", ctx.src.uri()))?;
    let dstkeys = if config.force_update {
        let (_tx, rx) = mpsc::channel(1);
        rx
    } else {
        list_all(
            ctx.dst.clone(),
            prefix,
            &config.start,
            &config.end,
            !config.links,
        )
        .await
        .with_context(|| format!("list {}", ctx.dst.uri()))?
    };
    produce(ctx, tasks, srckeys, dstkeys).await
}

/// Delimited listing of one level. Plain objects flow to the returned
/// channel; common prefixes go to `cp` (or are dropped when `cp` is None).
async fn list_common_prefix(
    ctx: &Arc<SyncContext>,
    store: &Arc<dyn ObjectStore>,
    prefix: &str,
    cp: Option<mpsc::Sender<ObjectEntry>>,
    follow_links: bool,
) -> Result<mpsc::Receiver<Result<ObjectEntry>>> {
    let scheme = scheme_of(store.as_ref());
    let page_size = if matches!(
        scheme.as_str(),
        "file" | "nfs" | "gluster" | "jfs" | "hdfs" | "webdav"
    ) {
        usize::MAX
    } else {
        MAX_RESULTS
    };
    let mut total: Vec<ObjectEntry> = Vec::new();
    let mut marker = String::new();
    let mut token = String::new();
    loop {
        let page = store
            .list(prefix, &marker, &token, "/", page_size, follow_links)
            .await?;
        if let Some(last) = page.entries.last() {
            marker = last.key.clone();
        }
        total.extend(page.entries);
        token = page.next_token;
        if !page.has_more {
            break;
        }
    }
    let (tx, rx) = mpsc::channel(1000);
    let prefix = prefix.to_string();
    tokio::spawn(async move {
        for obj in total {
            if obj.is_dir && obj.key.as_str() > prefix.as_str() {
                if let Some(cp) = &cp {
                    let _ = cp.send(obj).await;
                }
            } else if tx.send(Ok(obj)).await.is_err() {
                return;
            }
        }
    });
    Ok(rx)
}

/// Recursive parallel producer. Each common prefix becomes a new listing
/// root until the depth budget runs out; the fan-out gate bounds open list
/// calls across the whole process.
#[async_recursion]
pub(crate) async fn start_producer(
    ctx: Arc<SyncContext>,
    tasks: TaskSender,
    prefix: String,
    depth: u32,
) -> Result<()> {
    let permit = ctx.list_gate.acquire().await;
    if ctx.config.limit == 1 && ctx.config.rules.is_empty() {
        if produce_single_object(&ctx, &tasks, &prefix).await.is_ok() {
            return Ok(());
        }
    }
    if ctx.config.list_threads <= 1 || depth == 0 {
        return single_producer(&ctx, &tasks, &prefix).await;
    }

    let (cp_tx, mut cp_rx) = mpsc::channel::<ObjectEntry>(1000);
    let dispatcher = {
        let ctx = ctx.clone();
        let tasks = tasks.clone();
        tokio::spawn(async move {
            let mut processing: HashSet<String> = HashSet::new();
            let mut children = JoinSet::new();
            while let Some(c) = cp_rx.recv().await {
                let key = c.key;
                if !processing.insert(key.clone()) {
                    continue;
                }
                if !ctx.config.rules.is_empty() && !match_leveled_path(&ctx.config.rules, &key) {
                    tracing::info!("exclude prefix {}", key);
                    continue;
                }
                if key.as_str() < ctx.config.start.as_str() {
                    tracing::info!("ignore prefix {}", key);
                    continue;
                }
                if !ctx.config.end.is_empty() && key > ctx.config.end {
                    tracing::info!("ignore prefix {}", key);
                    continue;
                }
                let ctx = ctx.clone();
                let tasks = tasks.clone();
                children.spawn(async move {
                    if let Err(err) =
                        start_producer(ctx.clone(), tasks, key.clone(), depth - 1).await
                    {
                        tracing::error!("list prefix {}: {:#}", key, err);
                        ctx.counters.failed.inc();
                    }
                });
            }
            while children.join_next().await.is_some() {}
        })
    };

    let fall_back = |err: anyhow::Error, side: &str| -> Result<()> {
        if is_marker(&err, &SyncError::NotSupported) {
            Ok(())
        } else {
            Err(err).with_context(|| format!("list {} with delimiter", side))
        }
    };
    let srckeys = match list_common_prefix(&ctx, &ctx.src, &prefix, Some(cp_tx.clone()), !ctx.config.links)
        .await
    {
        Ok(rx) => rx,
        Err(err) => {
            drop(cp_tx);
            fall_back(err, &ctx.src.uri())?;
            return single_producer(&ctx, &tasks, &prefix).await;
        }
    };
    let dcp = if ctx.config.delete_dst {
        // search common prefixes on the destination side too
        Some(cp_tx.clone())
    } else {
        None
    };
    let dstkeys = if ctx.config.force_update {
        let (_tx, rx) = mpsc::channel(1);
        rx
    } else {
        match list_common_prefix(&ctx, &ctx.dst, &prefix, dcp, !ctx.config.links).await {
            Ok(rx) => rx,
            Err(err) => {
                drop(cp_tx);
                fall_back(err, &ctx.dst.uri())?;
                return single_producer(&ctx, &tasks, &prefix).await;
            }
        }
    };
    drop(cp_tx);

    produce(&ctx, &tasks, srckeys, dstkeys).await?;

    // the recursion below needs gate slots; give ours back first
    drop(permit);
    dispatcher.await.context("prefix dispatcher panicked")?;
    Ok(())
}

/// Fast path for a single exact key: HEAD both sides and run the merger over
/// two one-element streams.
pub(crate) async fn produce_single_object(
    ctx: &Arc<SyncContext>,
    tasks: &TaskSender,
    key: &str,
) -> Result<()> {
    let obj = match ctx.src.head(key).await {
        Ok(obj) => obj,
        Err(err) => {
            tracing::warn!("head {} from {}: {:#}", key, ctx.src.uri(), err);
            return Err(err);
        }
    };
    let eligible = !obj.is_dir
        || (obj.is_symlink && ctx.config.links)
        || (obj.is_dir && ctx.config.dirs && key.ends_with('/'));
    if !eligible {
        return Err(anyhow::Error::from(IgnoreDir));
    }
    let dobj = match ctx.dst.head(key).await {
        Ok(obj) => Some(obj),
        Err(err) if is_not_found(&err) => None,
        Err(err) => {
            tracing::warn!("head {} from {}: {:#}", key, ctx.dst.uri(), err);
            return Err(err);
        }
    };
    let (stx, srx) = mpsc::channel(1);
    let _ = stx.send(Ok(obj)).await;
    drop(stx);
    let (dtx, drx) = mpsc::channel(1);
    if let Some(dobj) = dobj {
        let _ = dtx.send(Ok(dobj)).await;
    }
    drop(dtx);
    tracing::debug!("produce single key {}", key);
    let _ = produce(ctx, tasks, srx, drx).await;
    Ok(())
}

/// Distribute the lines of the FilesFrom file as sub-prefixes across
/// `threads` listers.
pub(crate) async fn produce_from_list(ctx: &Arc<SyncContext>, tasks: &TaskSender) -> Result<()> {
    let path = ctx
        .config
        .files_from
        .clone()
        .context("files_from is not configured")?;
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("open {:?}", path))?;

    let threads = ctx.config.threads.max(1);
    let (prefix_tx, prefix_rx) = async_channel::bounded::<String>(threads);
    let mut consumers = JoinSet::new();
    for _ in 0..threads {
        let ctx = ctx.clone();
        let tasks = tasks.clone();
        let prefix_rx = prefix_rx.clone();
        consumers.spawn(async move {
            while let Ok(mut key) = prefix_rx.recv().await {
                if !key.ends_with('/') {
                    match produce_single_object(&ctx, &tasks, &key).await {
                        Ok(()) => {
                            ctx.counters.listed_prefix.inc();
                            continue;
                        }
                        Err(err) if err.is::<IgnoreDir>() => key.push('/'),
                        Err(_) => {}
                    }
                }
                tracing::debug!("start listing prefix {}", key);
                if let Err(err) =
                    start_producer(ctx.clone(), tasks.clone(), key.clone(), ctx.config.list_depth)
                        .await
                {
                    tracing::error!("list prefix {}: {:#}", key, err);
                    ctx.counters.failed.inc();
                }
                ctx.counters.listed_prefix.inc();
            }
        });
    }
    drop(prefix_rx);

    let mut lines = tokio::io::BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        let trimmed = line.trim_end();
        if trimmed != line {
            tracing::info!("found a prefix with a space character: {:?}", line);
        }
        if trimmed.is_empty() {
            continue;
        }
        prefix_tx
            .send(trimmed.to_string())
            .await
            .context("prefix channel closed")?;
    }
    drop(prefix_tx);
    while consumers.join_next().await.is_some() {}
    Ok(())
}
