//! Streaming CRC32C (Castagnoli) with ordered combine.
//!
//! Every part reports its CRC and exact length; the whole-object checksum is
//! the CRC32C-combine of the parts in stored order, independent of the order
//! in which they finished.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::SyncContext;
use crate::pool::STREAM_BUF_SIZE;
use crate::retry::SyncError;
use crate::store::ObjectStore;

/// Preferred range size for parallel checksum/compare reads and the unit the
/// part-size calculation starts from.
pub const DEFAULT_PART_SIZE: u64 = 5 << 20;

/// Objects below this go through the single PUT path.
pub const MAX_BLOCK: u64 = DEFAULT_PART_SIZE * 2;

/// Combine `(crc, len)` pairs in stored order into the checksum of the
/// concatenation.
pub fn combine(parts: &[(u32, u64)]) -> u32 {
    let mut iter = parts.iter();
    let Some(&(mut crc, _)) = iter.next() else {
        return 0;
    };
    for &(part_crc, len) in iter {
        crc = crc32c::crc32c_combine(crc, part_crc, len as usize);
    }
    crc
}

/// Reader wrapper updating a running CRC32C over every byte that passes
/// through. The handle stays valid after the reader is consumed by a PUT.
pub struct ChksumReader<R> {
    inner: R,
    crc: Arc<AtomicU32>,
    enabled: bool,
}

impl<R> ChksumReader<R> {
    pub fn new(inner: R, enabled: bool) -> (Self, Arc<AtomicU32>) {
        let crc = Arc::new(AtomicU32::new(0));
        (
            Self {
                inner,
                crc: crc.clone(),
                enabled,
            },
            crc,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChksumReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let pre = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if this.enabled {
                    let crc = this.crc.load(Ordering::Relaxed);
                    let crc = crc32c::crc32c_append(crc, &buf.filled()[pre..]);
                    this.crc.store(crc, Ordering::Relaxed);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// CRC32C of one byte range, read through the rate and concurrency gates.
pub(crate) async fn cal_part_chksum(
    ctx: &Arc<SyncContext>,
    store: &Arc<dyn ObjectStore>,
    key: &str,
    cancel: &CancellationToken,
    off: u64,
    len: u64,
) -> Result<u32> {
    ctx.bw_wait(len).await;
    let _permit = ctx
        .gate
        .acquire_cancellable(cancel)
        .await
        .map_err(|_| anyhow::Error::from(SyncError::Aborted))?;
    let mut reader = store
        .get(key, off, Some(len))
        .await
        .context("checksum get")?;
    let mut buf = ctx.stream_pool.acquire();
    let mut crc = 0u32;
    let mut left = len as usize;
    while left > 0 {
        let bs = left.min(STREAM_BUF_SIZE);
        let slice = &mut buf.as_mut_slice()[..bs];
        reader.read_exact(slice).await.context("checksum read")?;
        crc = crc32c::crc32c_append(crc, slice);
        left -= bs;
    }
    Ok(crc)
}

/// CRC32C of a whole object, computed by parallel ranged reads at
/// [`DEFAULT_PART_SIZE`] and combined in order.
pub(crate) async fn cal_obj_chksum(
    ctx: &Arc<SyncContext>,
    store: &Arc<dyn ObjectStore>,
    key: &str,
    size: u64,
) -> Result<u32> {
    let cancel = CancellationToken::new();
    if size < MAX_BLOCK {
        return cal_part_chksum(ctx, store, key, &cancel, 0, size).await;
    }
    let n = (size - 1) / DEFAULT_PART_SIZE + 1;
    let mut join = JoinSet::new();
    for i in 0..n {
        let sz = if i == n - 1 {
            size - i * DEFAULT_PART_SIZE
        } else {
            DEFAULT_PART_SIZE
        };
        let ctx = ctx.clone();
        let store = store.clone();
        let key = key.to_string();
        let cancel = cancel.clone();
        join.spawn(async move {
            let crc = cal_part_chksum(&ctx, &store, &key, &cancel, i * DEFAULT_PART_SIZE, sz).await;
            (i, crc, sz)
        });
    }
    let mut chksums = vec![(0u32, 0u64); n as usize];
    let mut first_err = None;
    while let Some(res) = join.join_next().await {
        let (i, crc, sz) = res?;
        match crc {
            Ok(crc) => chksums[i as usize] = (crc, sz),
            Err(err) => {
                cancel.cancel();
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(combine(&chksums)),
    }
}
