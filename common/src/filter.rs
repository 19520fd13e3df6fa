//! Applies size, age, time-window and rule filtering to a descriptor stream.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::context::SyncContext;
use crate::object::ObjectEntry;
use crate::rules::{match_full_path, match_leveled_path};

/// Does this entry survive the configured windows and rules? Size and time
/// windows only apply to plain objects; directories and symlinks pass
/// straight to the rule check.
pub(crate) fn filter_key(ctx: &SyncContext, obj: &ObjectEntry, now: SystemTime) -> bool {
    let config = &ctx.config;
    if !obj.is_dir && !obj.is_symlink {
        if obj.size < config.min_size || obj.size > config.max_size {
            return false;
        }
        if let Some(max_age) = config.max_age {
            if obj.mtime <= now - max_age {
                return false;
            }
        }
        if let Some(min_age) = config.min_age {
            if obj.mtime >= now - min_age {
                return false;
            }
        }
        if let Some(start_time) = config.start_time {
            if obj.mtime <= start_time {
                return false;
            }
        }
        if let Some(end_time) = config.end_time {
            if obj.mtime >= end_time {
                return false;
            }
        }
    }
    if config.match_full_path {
        match_full_path(&config.rules, &obj.key)
    } else {
        match_leveled_path(&config.rules, &obj.key)
    }
}

/// Wrap a listing stream, dropping filtered entries into the excluded
/// counters. Listing failures pass through untouched.
pub(crate) fn filter_stream(
    ctx: Arc<SyncContext>,
    mut keys: mpsc::Receiver<Result<ObjectEntry>>,
) -> mpsc::Receiver<Result<ObjectEntry>> {
    let (tx, rx) = mpsc::channel(1);
    let now = ctx.run_start;
    tokio::spawn(async move {
        while let Some(res) = keys.recv().await {
            match res {
                Ok(obj) => {
                    if filter_key(&ctx, &obj, now) {
                        if tx.send(Ok(obj)).await.is_err() {
                            return;
                        }
                    } else {
                        tracing::debug!(
                            "exclude {} size: {}, mtime: {:?}",
                            obj.key,
                            obj.size,
                            obj.mtime
                        );
                        ctx.counters.excluded.inc();
                        ctx.counters.excluded_bytes.add(obj.size);
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mem::MemStore;
    use crate::rules::Rule;
    use std::time::Duration;

    fn ctx_with(config: Config) -> Arc<SyncContext> {
        SyncContext::new(
            Arc::new(MemStore::new("s")),
            Arc::new(MemStore::new("d")),
            config,
        )
    }

    fn obj(key: &str, size: u64, age: Duration, now: SystemTime) -> ObjectEntry {
        ObjectEntry::new(key, size, now - age)
    }

    #[tokio::test]
    async fn size_window() {
        let ctx = ctx_with(Config {
            min_size: 10,
            max_size: 100,
            ..Default::default()
        });
        let now = ctx.run_start;
        assert!(!filter_key(&ctx, &obj("a", 5, Duration::ZERO, now), now));
        assert!(filter_key(&ctx, &obj("a", 50, Duration::ZERO, now), now));
        assert!(!filter_key(&ctx, &obj("a", 500, Duration::ZERO, now), now));
        // directories ignore the size window
        assert!(filter_key(&ctx, &obj("d/", 0, Duration::ZERO, now), now));
    }

    #[tokio::test]
    async fn age_windows_relative_to_run_start() {
        let ctx = ctx_with(Config {
            min_age: Some(Duration::from_secs(60)),
            max_age: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let now = ctx.run_start;
        // too fresh for min_age
        assert!(!filter_key(&ctx, &obj("a", 1, Duration::from_secs(10), now), now));
        assert!(filter_key(&ctx, &obj("a", 1, Duration::from_secs(600), now), now));
        // too old for max_age
        assert!(!filter_key(&ctx, &obj("a", 1, Duration::from_secs(7200), now), now));
    }

    #[tokio::test]
    async fn rules_reject_via_selected_engine() {
        let ctx = ctx_with(Config {
            rules: vec![Rule {
                pattern: "*.log".to_string(),
                include: false,
            }],
            ..Default::default()
        });
        let now = ctx.run_start;
        assert!(!filter_key(&ctx, &obj("x/y.log", 1, Duration::ZERO, now), now));
        assert!(filter_key(&ctx, &obj("x/y.txt", 1, Duration::ZERO, now), now));
    }

    #[tokio::test]
    async fn stream_counts_excluded() -> Result<()> {
        let ctx = ctx_with(Config {
            min_size: 3,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(4);
        let now = ctx.run_start;
        tx.send(Ok(obj("keep", 4, Duration::ZERO, now))).await.unwrap();
        tx.send(Ok(obj("drop", 1, Duration::ZERO, now))).await.unwrap();
        drop(tx);
        let mut out = filter_stream(ctx.clone(), rx);
        let mut keys = Vec::new();
        while let Some(res) = out.recv().await {
            keys.push(res?.key);
        }
        assert_eq!(keys, ["keep"]);
        assert_eq!(ctx.counters.excluded.get(), 1);
        assert_eq!(ctx.counters.excluded_bytes.get(), 1);
        Ok(())
    }
}
