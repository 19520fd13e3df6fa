//! Post-copy verification: CRC32C comparison or byte-wise ranged compare.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::checksum::{cal_obj_chksum, DEFAULT_PART_SIZE, MAX_BLOCK};
use crate::context::SyncContext;
use crate::object::ObjectEntry;
use crate::pool::STREAM_BUF_SIZE;
use crate::retry::{is_marker, try_n, SyncError};

/// Compare one byte range of the source and destination objects.
async fn comp_part_binary(
    ctx: &Arc<SyncContext>,
    key: &str,
    cancel: &CancellationToken,
    off: u64,
    len: u64,
) -> Result<()> {
    ctx.bw_wait(len).await;
    let _permit = ctx
        .gate
        .acquire_cancellable(cancel)
        .await
        .map_err(|_| anyhow::Error::from(SyncError::Aborted))?;
    let mut src = ctx.src.get(key, off, Some(len)).await.context("src get")?;
    let mut dst = ctx.dst.get(key, off, Some(len)).await.context("dest get")?;
    let mut sbuf = ctx.stream_pool.acquire();
    let mut dbuf = ctx.stream_pool.acquire();
    let mut left = len as usize;
    while left > 0 {
        let bs = left.min(STREAM_BUF_SIZE);
        src.read_exact(&mut sbuf.as_mut_slice()[..bs])
            .await
            .context("src read")?;
        dst.read_exact(&mut dbuf.as_mut_slice()[..bs])
            .await
            .context("dest read")?;
        if sbuf.as_mut_slice()[..bs] != dbuf.as_mut_slice()[..bs] {
            return Err(anyhow::Error::from(SyncError::BytesNotEqual));
        }
        left -= bs;
    }
    Ok(())
}

/// Byte-wise equality of the whole object, in parallel ranges. A detected
/// difference is a verdict, not an error.
async fn comp_obj_binary(ctx: &Arc<SyncContext>, key: &str, size: u64) -> Result<bool> {
    let cancel = CancellationToken::new();
    let res = if size < MAX_BLOCK {
        comp_part_binary(ctx, key, &cancel, 0, size).await
    } else {
        let n = (size - 1) / DEFAULT_PART_SIZE + 1;
        let mut join = JoinSet::new();
        for i in 0..n {
            let sz = if i == n - 1 {
                size - i * DEFAULT_PART_SIZE
            } else {
                DEFAULT_PART_SIZE
            };
            let ctx = ctx.clone();
            let key = key.to_string();
            let cancel = cancel.clone();
            join.spawn(async move {
                comp_part_binary(&ctx, &key, &cancel, i * DEFAULT_PART_SIZE, sz).await
            });
        }
        let mut first_err = None;
        while let Some(res) = join.join_next().await {
            if let Err(err) = res? {
                cancel.cancel();
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    };
    match res {
        Ok(()) => Ok(true),
        Err(err) if is_marker(&err, &SyncError::BytesNotEqual) => Ok(false),
        Err(err) => Err(err),
    }
}

async fn do_check_sum(
    ctx: &Arc<SyncContext>,
    key: &str,
    src_chksum: Option<u32>,
    obj: &ObjectEntry,
) -> Result<bool> {
    if obj.is_symlink && ctx.config.links && (ctx.config.check_all || ctx.config.check_new) {
        let src_link = match ctx.src.symlinks() {
            Some(s) => s.read_link(key).await?,
            None => String::new(),
        };
        let dst_link = match ctx.dst.symlinks() {
            Some(s) => s.read_link(key).await?,
            None => String::new(),
        };
        return Ok(src_link == dst_link && !src_link.is_empty() && !dst_link.is_empty());
    }
    match src_chksum {
        Some(src_crc) => {
            let dst_crc = cal_obj_chksum(ctx, &ctx.dst, key, obj.size).await?;
            Ok(src_crc == dst_crc)
        }
        None => comp_obj_binary(ctx, key, obj.size).await,
    }
}

/// Verify `key` on the destination. `src_chksum` comes from the copy that
/// just finished; `None` forces reading both sides.
pub async fn check_sum(
    ctx: &Arc<SyncContext>,
    key: &str,
    src_chksum: Option<u32>,
    obj: &ObjectEntry,
) -> Result<bool> {
    let started = std::time::Instant::now();
    let res = try_n(3, || do_check_sum(ctx, key, src_chksum, obj)).await;
    match &res {
        Ok(equal) => {
            ctx.counters.checked.inc();
            ctx.counters.checked_bytes.add(obj.size);
            if *equal {
                tracing::debug!("checked {} OK (and equal) in {:?}", key, started.elapsed());
            } else {
                tracing::warn!(
                    "checked {} OK (but NOT equal) in {:?}",
                    key,
                    started.elapsed()
                );
            }
        }
        Err(err) => {
            tracing::error!(
                "failed to check {} in {:?}: {:#}",
                key,
                started.elapsed(),
                err
            );
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mem::MemStore;
    use crate::store::ObjectStore;
    use std::time::UNIX_EPOCH;

    fn setup(data: &[u8]) -> (Arc<MemStore>, Arc<MemStore>, ObjectEntry) {
        let src = Arc::new(MemStore::new("src"));
        let dst = Arc::new(MemStore::new("dst"));
        src.insert("k", data, UNIX_EPOCH);
        dst.insert("k", data, UNIX_EPOCH);
        let obj = ObjectEntry::new("k", data.len() as u64, UNIX_EPOCH);
        (src, dst, obj)
    }

    #[tokio::test]
    async fn checksum_mode_matches_clean_copy() -> Result<()> {
        let data = b"identical bytes".to_vec();
        let (src, dst, obj) = setup(&data);
        let ctx = SyncContext::new(src, dst, Config::default());
        let crc = crc32c::crc32c(&data);
        assert!(check_sum(&ctx, "k", Some(crc), &obj).await?);
        assert!(!check_sum(&ctx, "k", Some(crc ^ 1), &obj).await?);
        assert_eq!(ctx.counters.checked.get(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn bytewise_mode_detects_single_flipped_byte() -> Result<()> {
        let data: Vec<u8> = (0..(MAX_BLOCK + 4096) as usize)
            .map(|i| (i % 7) as u8)
            .collect();
        let (src, dst, obj) = setup(&data);
        let ctx = SyncContext::new(src, dst.clone(), Config::default());
        assert!(check_sum(&ctx, "k", None, &obj).await?);
        dst.corrupt("k", data.len() / 2);
        assert!(!check_sum(&ctx, "k", None, &obj).await?);
        Ok(())
    }

    #[tokio::test]
    async fn symlink_targets_compared_as_strings() -> Result<()> {
        let src = Arc::new(MemStore::new("src"));
        let dst = Arc::new(MemStore::new("dst"));
        src.symlinks().unwrap().symlink("target", "l").await?;
        dst.symlinks().unwrap().symlink("target", "l").await?;
        let mut obj = ObjectEntry::new("l", 0, UNIX_EPOCH);
        obj.is_symlink = true;
        let config = Config {
            links: true,
            check_new: true,
            ..Default::default()
        };
        let ctx = SyncContext::new(src, dst.clone(), config);
        assert!(check_sum(&ctx, "l", None, &obj).await?);
        dst.symlinks().unwrap().symlink("other", "l").await?;
        assert!(!check_sum(&ctx, "l", None, &obj).await?);
        Ok(())
    }
}
