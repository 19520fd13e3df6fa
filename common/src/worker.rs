//! Task consumers: dispatch actions, drive copies, verify, delete, and keep
//! the counters honest.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::context::SyncContext;
use crate::copy::copy_data;
use crate::object::{Action, ObjectEntry};
use crate::retry::{is_marker, is_not_found, try_n, SyncError};
use crate::store::ObjectStore;
use crate::verify::check_sum;

pub(crate) async fn worker(ctx: Arc<SyncContext>, tasks: async_channel::Receiver<Action>) {
    while let Ok(action) = tasks.recv().await {
        handle_action(&ctx, action).await;
        ctx.counters.incr_handled(1);
    }
}

async fn handle_action(ctx: &Arc<SyncContext>, action: Action) {
    match action {
        Action::DeleteSrc(obj) => delete_obj(ctx, &ctx.src, &obj.key).await,
        Action::DeleteDst(obj) => delete_obj(ctx, &ctx.dst, &obj.key).await,
        Action::CopyPerms(obj) => {
            if ctx.config.dry {
                tracing::debug!("will copy permissions for {}", obj.key);
            } else {
                copy_perms(ctx, &obj).await;
            }
            ctx.counters.copied.inc();
        }
        Action::Checksum(obj) => {
            if ctx.config.dry {
                tracing::debug!("will compare checksum for {}", obj.key);
                ctx.counters.checked.inc();
                return;
            }
            match check_sum(ctx, &obj.key, None, &obj).await {
                Err(_) => ctx.counters.failed.inc(),
                Ok(true) => checksum_equal_followup(ctx, obj).await,
                // the two objects differ after all
                Ok(false) => copy_object(ctx, obj).await,
            }
        }
        Action::Copy(obj) => copy_object(ctx, obj).await,
    }
}

/// The checksum verdict said both sides hold the same bytes; what remains is
/// source deletion, permission propagation, or a plain skip.
async fn checksum_equal_followup(ctx: &Arc<SyncContext>, obj: ObjectEntry) {
    if ctx.config.delete_src {
        if obj.is_dir {
            ctx.defer_delete_src(&obj.key);
        } else {
            delete_obj(ctx, &ctx.src, &obj.key).await;
        }
    } else if ctx.config.perms && (!obj.is_symlink || !ctx.config.links) {
        match ctx.dst.head(&obj.key).await {
            Ok(dst_obj) => {
                if need_copy_perms(&obj, &dst_obj) {
                    copy_perms(ctx, &obj).await;
                    ctx.counters.copied.inc();
                } else {
                    ctx.counters.skipped.inc();
                    ctx.counters.skipped_bytes.add(obj.size);
                }
            }
            Err(err) => {
                tracing::warn!("failed to head object {}: {:#}", obj.key, err);
                ctx.counters.failed.inc();
            }
        }
    } else {
        ctx.counters.skipped.inc();
        ctx.counters.skipped_bytes.add(obj.size);
    }
}

async fn copy_object(ctx: &Arc<SyncContext>, obj: ObjectEntry) {
    let key = obj.key.clone();
    if ctx.config.dry {
        tracing::debug!("will copy {} ({} bytes)", key, obj.size);
        ctx.counters.copied.inc();
        ctx.counters.copied_bytes.add(obj.size);
        return;
    }
    let cal_chksum = ctx.config.check_all || ctx.config.check_new;
    let mut src_chksum = 0u32;
    let mut res: Result<()> = Ok(());
    if ctx.config.links && obj.is_symlink {
        if let Err(err) = copy_link(ctx, &key).await {
            tracing::error!("copy link failed: {:#}", err);
            res = Err(err);
        }
    } else {
        match copy_data(ctx, &key, obj.size, cal_chksum).await {
            Ok(crc) => src_chksum = crc,
            Err(err) => res = Err(err),
        }
    }
    res = res.map_err(|err| {
        if is_marker(&err, &SyncError::ExternalLink) {
            tracing::warn!("skip external link {}: {:#}", key, err);
            anyhow::Error::from(SyncError::Skipped)
        } else {
            err
        }
    });

    if res.is_ok() && ctx.config.check_change {
        res = check_change(ctx, &obj).await;
    }
    if res.is_ok() && cal_chksum {
        res = match check_sum(ctx, &key, Some(src_chksum), &obj).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(anyhow::anyhow!(
                "checksums of copied object {} don't match",
                key
            )),
            Err(err) => Err(err),
        };
    }
    match res {
        Ok(()) => {
            if let Some(mtimes) = ctx.dst.mtimes() {
                if let Err(err) = mtimes.set_mtime(&key, obj.mtime).await {
                    if !is_marker(&err, &SyncError::NotSupported) {
                        tracing::warn!("update mtime of {}: {:#}", key, err);
                    }
                }
            }
            if ctx.config.perms {
                copy_perms(ctx, &obj).await;
            }
            ctx.counters.copied.inc();
        }
        Err(err) if is_marker(&err, &SyncError::Skipped) => ctx.counters.skipped.inc(),
        Err(err) => {
            ctx.counters.failed.inc();
            tracing::error!("failed to copy object {}: {:#}", key, err);
        }
    }
}

/// Best-effort detection of a source that changed under the sync: re-HEAD
/// the source and confirm the copied size on the destination.
async fn check_change(ctx: &Arc<SyncContext>, obj: &ObjectEntry) -> Result<()> {
    if ctx.config.links && obj.is_symlink {
        return Ok(());
    }
    let key = &obj.key;
    let cur = match ctx.src.head(key).await {
        Ok(cur) => cur,
        Err(err) if is_not_found(&err) => {
            bail!("object {} was removed during sync", key)
        }
        Err(err) => {
            return Err(err).with_context(|| format!("check {} in {}", key, ctx.src.uri()))
        }
    };
    if !ctx.config.check_all && !ctx.config.check_new {
        ctx.counters.checked.inc();
        ctx.counters.checked_bytes.add(obj.size);
    }
    let mut equal = cur.size == obj.size;
    if equal && cur.mtime != obj.mtime {
        // HEAD may drop the sub-second part of the mtime the listing had
        equal = cur.mtime_unix() == obj.mtime_unix() && cur.mtime_subsec_millis() == 0;
    }
    if !equal {
        bail!(
            "{} changed during sync. Original: size={}, mtime={:?}; Current: size={}, mtime={:?}",
            key,
            obj.size,
            obj.mtime,
            cur.size,
            cur.mtime
        );
    }
    match ctx.dst.head(key).await {
        Ok(dst_obj) => {
            if dst_obj.size != cur.size {
                bail!(
                    "copied {} size mismatch: original={}, current={}",
                    key,
                    obj.size,
                    dst_obj.size
                );
            }
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("check {} in {}", key, ctx.dst.uri())),
    }
}

async fn copy_link(ctx: &Arc<SyncContext>, key: &str) -> Result<()> {
    let src_links = ctx
        .src
        .symlinks()
        .ok_or_else(|| anyhow::Error::from(SyncError::NotSupported))
        .context("source does not support symlinks")?;
    let target = src_links.read_link(key).await?;
    // a leftover destination object would shadow the new link
    ctx.dst
        .delete(key)
        .await
        .with_context(|| format!("delete {} before linking", key))?;
    let dst_links = ctx
        .dst
        .symlinks()
        .ok_or_else(|| anyhow::Error::from(SyncError::NotSupported))
        .context("destination does not support symlinks")?;
    dst_links.symlink(&target, key).await
}

pub(crate) fn need_copy_perms(o1: &ObjectEntry, o2: &ObjectEntry) -> bool {
    match (&o1.attrs, &o2.attrs) {
        (Some(a1), Some(a2)) => a1.mode != a2.mode || a1.owner != a2.owner || a1.group != a2.group,
        _ => false,
    }
}

async fn copy_perms(ctx: &Arc<SyncContext>, obj: &ObjectEntry) {
    let started = std::time::Instant::now();
    let key = &obj.key;
    let Some(attrs) = &obj.attrs else {
        tracing::warn!("no file attributes for {}", key);
        return;
    };
    if !obj.is_symlink || !ctx.config.links {
        match ctx.dst.attrs() {
            Some(store) => {
                // chmod after chown: chown invalidates setuid/setgid bits
                if let Err(err) = store.chown(key, &attrs.owner, &attrs.group).await {
                    tracing::warn!(
                        "chown {} to ({},{}): {:#}",
                        key,
                        attrs.owner,
                        attrs.group,
                        err
                    );
                }
                if let Err(err) = store.chmod(key, attrs.mode).await {
                    tracing::warn!("chmod {} to {:o}: {:#}", key, attrs.mode, err);
                }
            }
            None => tracing::warn!("{} does not support permissions", ctx.dst.uri()),
        }
    }
    tracing::debug!(
        "copied permissions ({}:{}:{:o}) for {} in {:?}",
        attrs.owner,
        attrs.group,
        attrs.mode,
        key,
        started.elapsed()
    );
}

pub(crate) async fn delete_obj(ctx: &Arc<SyncContext>, store: &Arc<dyn ObjectStore>, key: &str) {
    if ctx.config.dry {
        tracing::debug!("will delete {} from {}", key, store.uri());
        ctx.counters.deleted.inc();
        return;
    }
    let started = std::time::Instant::now();
    match try_n(3, || store.delete(key)).await {
        Ok(()) => {
            ctx.counters.deleted.inc();
            tracing::debug!("deleted {} from {} in {:?}", key, store.uri(), started.elapsed());
        }
        Err(err) => {
            ctx.counters.failed.inc();
            tracing::error!(
                "failed to delete {} from {} in {:?}: {:#}",
                key,
                store.uri(),
                started.elapsed(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mem::MemStore;
    use crate::object::FileAttrs;
    use std::time::{Duration, UNIX_EPOCH};

    fn stores() -> (Arc<MemStore>, Arc<MemStore>) {
        (Arc::new(MemStore::new("src")), Arc::new(MemStore::new("dst")))
    }

    #[tokio::test]
    async fn copy_action_lands_object_and_counts() {
        let (src, dst) = stores();
        src.insert("a", b"hello", UNIX_EPOCH);
        let ctx = crate::context::SyncContext::new(src, dst.clone(), Config::default());
        handle_action(&ctx, Action::Copy(ObjectEntry::new("a", 5, UNIX_EPOCH))).await;
        assert_eq!(dst.data("a").unwrap(), b"hello");
        assert_eq!(ctx.counters.copied.get(), 1);
        assert_eq!(ctx.counters.copied_bytes.get(), 5);
        assert_eq!(ctx.counters.failed.get(), 0);
    }

    #[tokio::test]
    async fn copy_propagates_mtime() {
        let (src, dst) = stores();
        let mtime = UNIX_EPOCH + Duration::from_secs(1234);
        src.insert("a", b"x", mtime);
        let ctx = crate::context::SyncContext::new(src, dst.clone(), Config::default());
        handle_action(&ctx, Action::Copy(ObjectEntry::new("a", 1, mtime))).await;
        assert_eq!(dst.mtime_of("a").unwrap(), mtime);
    }

    #[tokio::test]
    async fn vanished_source_counts_as_skipped() {
        let (src, dst) = stores();
        let ctx = crate::context::SyncContext::new(src, dst, Config::default());
        handle_action(&ctx, Action::Copy(ObjectEntry::new("ghost", 3, UNIX_EPOCH))).await;
        assert_eq!(ctx.counters.skipped.get(), 1);
        assert_eq!(ctx.counters.failed.get(), 0);
    }

    #[tokio::test]
    async fn check_change_detects_source_mutation() {
        let (src, dst) = stores();
        src.insert("a", b"now longer", UNIX_EPOCH);
        dst.insert("a", b"now longer", UNIX_EPOCH);
        let ctx = crate::context::SyncContext::new(
            src,
            dst,
            Config {
                check_change: true,
                ..Default::default()
            },
        );
        // listing said 4 bytes, the store now has 10
        let obj = ObjectEntry::new("a", 4, UNIX_EPOCH);
        let err = check_change(&ctx, &obj).await.unwrap_err();
        assert!(err.to_string().contains("changed during sync"));
    }

    #[tokio::test]
    async fn check_change_tolerates_truncated_head_mtime() {
        let (src, dst) = stores();
        let head_mtime = UNIX_EPOCH + Duration::from_secs(100);
        src.insert("a", b"data", head_mtime);
        dst.insert("a", b"data", head_mtime);
        let ctx = crate::context::SyncContext::new(
            src,
            dst,
            Config {
                check_change: true,
                ..Default::default()
            },
        );
        // the listing carried millisecond precision, HEAD only seconds
        let obj = ObjectEntry::new("a", 4, head_mtime + Duration::from_millis(300));
        assert!(check_change(&ctx, &obj).await.is_ok());
        assert_eq!(ctx.counters.checked.get(), 1);
    }

    #[tokio::test]
    async fn symlink_replication() {
        let (src, dst) = stores();
        src.symlinks().unwrap().symlink("target/file", "l").await.unwrap();
        dst.insert("l", b"stale object", UNIX_EPOCH);
        let ctx = crate::context::SyncContext::new(
            src,
            dst.clone(),
            Config {
                links: true,
                ..Default::default()
            },
        );
        let mut obj = ObjectEntry::new("l", 0, UNIX_EPOCH);
        obj.is_symlink = true;
        handle_action(&ctx, Action::Copy(obj)).await;
        assert_eq!(
            dst.symlinks().unwrap().read_link("l").await.unwrap(),
            "target/file"
        );
        assert_eq!(ctx.counters.copied.get(), 1);
    }

    #[tokio::test]
    async fn checksum_action_skips_equal_objects() {
        let (src, dst) = stores();
        src.insert("a", b"same", UNIX_EPOCH);
        dst.insert("a", b"same", UNIX_EPOCH);
        let ctx = crate::context::SyncContext::new(src, dst, Config::default());
        handle_action(&ctx, Action::Checksum(ObjectEntry::new("a", 4, UNIX_EPOCH))).await;
        assert_eq!(ctx.counters.skipped.get(), 1);
        assert_eq!(ctx.counters.checked.get(), 1);
        assert_eq!(ctx.counters.copied.get(), 0);
    }

    #[tokio::test]
    async fn checksum_action_copies_divergent_objects() {
        let (src, dst) = stores();
        src.insert("a", b"new contents", UNIX_EPOCH);
        dst.insert("a", b"old contents", UNIX_EPOCH);
        let ctx = crate::context::SyncContext::new(src, dst.clone(), Config::default());
        handle_action(&ctx, Action::Checksum(ObjectEntry::new("a", 12, UNIX_EPOCH))).await;
        assert_eq!(dst.data("a").unwrap(), b"new contents");
        assert_eq!(ctx.counters.copied.get(), 1);
    }

    #[tokio::test]
    async fn copy_perms_action_applies_attrs() {
        let (src, dst) = stores();
        dst.insert("a", b"x", UNIX_EPOCH);
        let ctx = crate::context::SyncContext::new(
            src,
            dst.clone(),
            Config {
                perms: true,
                ..Default::default()
            },
        );
        let mut obj = ObjectEntry::new("a", 1, UNIX_EPOCH);
        obj.attrs = Some(FileAttrs {
            mode: 0o640,
            owner: "12".to_string(),
            group: "34".to_string(),
        });
        handle_action(&ctx, Action::CopyPerms(obj)).await;
        let attrs = dst.attrs_of("a").unwrap();
        assert_eq!(attrs.mode, 0o640);
        assert_eq!(attrs.owner, "12");
        assert_eq!(ctx.counters.copied.get(), 1);
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let (src, dst) = stores();
        src.insert("a", b"hello", UNIX_EPOCH);
        dst.insert("extra", b"x", UNIX_EPOCH);
        let ctx = crate::context::SyncContext::new(
            src,
            dst.clone(),
            Config {
                dry: true,
                delete_dst: true,
                ..Default::default()
            },
        );
        handle_action(&ctx, Action::Copy(ObjectEntry::new("a", 5, UNIX_EPOCH))).await;
        handle_action(&ctx, Action::DeleteDst(ObjectEntry::new("extra", 1, UNIX_EPOCH))).await;
        assert!(dst.data("a").is_none());
        assert!(dst.data("extra").is_some());
        assert_eq!(ctx.counters.copied.get(), 1);
        assert_eq!(ctx.counters.deleted.get(), 1);
    }
}
