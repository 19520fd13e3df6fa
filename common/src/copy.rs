//! Checksum-verified copy of a single key.
//!
//! Three regimes, chosen by size and destination capability: a single
//! GET→PUT for small objects, a parallel ranged download re-serialized into
//! one streaming PUT (spilling to an unlinked temp file when the destination
//! cannot take a stream), and a multipart upload whose parts are either
//! buffered GET→UploadPart round trips or server-side ranges staged through
//! an intermediate upload.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ReadBuf};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::checksum::{combine, ChksumReader, DEFAULT_PART_SIZE, MAX_BLOCK};
use crate::context::SyncContext;
use crate::pool::SizedBuf;
use crate::retry::{is_marker, is_not_found, try_n, SyncError};
use crate::store::{
    fast_stream_read, is_filesystem, read_in_mem, scheme_of, stream_write, MultipartUpload, Part,
};

/// Chunk size of the parallel downloader.
const DOWNLOAD_BUF_SIZE: u64 = 10 << 20;

/// Ranges at or below this size are cheaper to re-upload than to stage a
/// server-side part copy.
const PART_COPY_MIN: u64 = 32 << 20;

/// Copy the data of `key` and return the CRC32C of the source bytes observed
/// during the transfer (0 when `cal_chksum` is off).
pub async fn copy_data(ctx: &Arc<SyncContext>, key: &str, size: u64, cal_chksum: bool) -> Result<u32> {
    let started = std::time::Instant::now();
    let res = if size < MAX_BLOCK {
        try_n(3, || copy_in_full(ctx, key, size, cal_chksum)).await
    } else {
        match ctx.dst.multipart() {
            None => try_n(3, || copy_in_full(ctx, key, size, cal_chksum)).await,
            Some(mp) => match mp.create_upload(key).await {
                Ok(upload) => copy_multipart(ctx, key, size, upload, cal_chksum).await,
                Err(err) if is_marker(&err, &SyncError::NotSupported) => {
                    try_n(3, || copy_in_full(ctx, key, size, cal_chksum)).await
                }
                Err(_) => match try_n(2, || mp.create_upload(key)).await {
                    Ok(upload) => copy_multipart(ctx, key, size, upload, cal_chksum).await,
                    Err(err) => Err(err),
                },
            },
        }
    };
    match &res {
        Ok(_) => tracing::debug!(
            "copied data of {} ({} bytes) in {:?}",
            key,
            size,
            started.elapsed()
        ),
        Err(err) => tracing::error!(
            "failed to copy data of {} in {:?}: {:#}",
            key,
            started.elapsed(),
            err
        ),
    }
    res
}

/// Whole-object copy without multipart. Large objects on slow-reading
/// sources go through the parallel downloader; everything else is one
/// GET→PUT.
async fn copy_in_full(ctx: &Arc<SyncContext>, key: &str, size: u64, cal_chksum: bool) -> Result<u32> {
    let src_scheme = scheme_of(ctx.src.as_ref());
    let dst_scheme = scheme_of(ctx.dst.as_ref());
    if size > MAX_BLOCK && !read_in_mem(&dst_scheme) && !fast_stream_read(&src_scheme) {
        let mut downer = parallel_download(ctx, key, size);
        let res = if stream_write(&dst_scheme) {
            let (reader, crc) = ChksumReader::new(downer, cal_chksum);
            ctx.dst
                .put(key, Box::new(reader))
                .await
                .map(|()| crc.load(std::sync::atomic::Ordering::Relaxed))
        } else {
            match spill_to_temp(ctx, &mut downer).await {
                Ok(file) => {
                    let (reader, crc) = ChksumReader::new(file, cal_chksum);
                    ctx.dst
                        .put(key, Box::new(reader))
                        .await
                        .map(|()| crc.load(std::sync::atomic::Ordering::Relaxed))
                }
                Err(err) => {
                    tracing::warn!("create temp file: {:#}", err);
                    return copy_simple(ctx, key, size, cal_chksum).await;
                }
            }
        };
        return match res {
            Ok(crc) => {
                ctx.counters.copied_bytes.add(size);
                Ok(crc)
            }
            Err(err) => Err(demote_missing_src(ctx, key, err).await),
        };
    }
    copy_simple(ctx, key, size, cal_chksum).await
}

/// Drain `reader` into an unlinked temp file and rewind it, so a destination
/// that needs a seekable body can re-read the object.
async fn spill_to_temp(
    ctx: &Arc<SyncContext>,
    reader: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<tokio::fs::File> {
    let file = tempfile::tempfile().context("create temp file")?;
    let mut file = tokio::fs::File::from_std(file);
    let mut buf = ctx.stream_pool.acquire();
    loop {
        let n = reader.read(buf.as_mut_slice()).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf.as_mut_slice()[..n]).await?;
    }
    file.seek(std::io::SeekFrom::Start(0)).await?;
    Ok(file)
}

/// Single GET→PUT under one gate slot.
async fn copy_simple(ctx: &Arc<SyncContext>, key: &str, size: u64, cal_chksum: bool) -> Result<u32> {
    let _permit = ctx.gate.acquire().await;
    let reader: crate::store::Reader = if size == 0 {
        let dst_scheme = scheme_of(ctx.dst.as_ref());
        if key.is_empty() && !is_filesystem(&dst_scheme) {
            let uri = ctx.dst.uri();
            let parts: Vec<&str> = uri.splitn(4, '/').collect();
            if parts.len() == 4 && parts[3].is_empty() {
                tracing::warn!("empty key is not supported by {}, ignore it", uri);
                return Ok(0);
            }
        }
        if is_filesystem(&scheme_of(ctx.src.as_ref())) {
            // surfaces permission errors the zero-length PUT would hide
            let probe = ctx.src.get(key, 0, None).await?;
            drop(probe);
        }
        Box::new(std::io::Cursor::new(Vec::new()))
    } else {
        match ctx.src.get(key, 0, Some(size)).await {
            Ok(reader) => reader,
            Err(err) => return Err(demote_missing_src(ctx, key, err).await),
        }
    };
    ctx.bw_wait(size).await;
    let (reader, crc) = ChksumReader::new(reader, cal_chksum);
    ctx.dst.put(key, Box::new(reader)).await?;
    ctx.counters.copied_bytes.add(size);
    Ok(crc.load(std::sync::atomic::Ordering::Relaxed))
}

/// A GET that fails because the source key vanished is a skip, not a
/// failure.
async fn demote_missing_src(ctx: &Arc<SyncContext>, key: &str, err: anyhow::Error) -> anyhow::Error {
    if let Err(head_err) = ctx.src.head(key).await {
        if is_not_found(&head_err) {
            tracing::debug!("head src {}: {:#}", key, err);
            return err.context(SyncError::Skipped);
        }
    }
    err
}

fn choose_part_size(upload: &MultipartUpload, size: u64) -> u64 {
    let mut part_size = upload.min_part_size;
    if part_size == 0 {
        part_size = DEFAULT_PART_SIZE;
    }
    if size > part_size.saturating_mul(u64::from(upload.max_count)) {
        part_size = size / u64::from(upload.max_count);
        part_size = (((part_size - 1) >> 20) + 1) << 20; // align to MiB
    }
    part_size
}

/// Buffered GET→UploadPart of one range. Part numbers start from 1.
async fn upload_part_buffered(
    ctx: &Arc<SyncContext>,
    src_key: &str,
    off: u64,
    size: u64,
    key: &str,
    upload_id: &str,
    num: u32,
    cal_chksum: bool,
) -> Result<(Part, u32)> {
    ctx.bw_wait(size).await;
    let started = std::time::Instant::now();
    let mp = ctx
        .dst
        .multipart()
        .context("destination lost its multipart capability")?;
    let res = try_n(3, || async {
        let mut data = ctx.part_pool.acquire(size as usize);
        let mut reader = ctx.src.get(src_key, off, Some(size)).await?;
        reader.read_exact(data.as_mut_slice()).await?;
        let crc = if cal_chksum {
            crc32c::crc32c(data.as_slice())
        } else {
            0
        };
        let part = mp.upload_part(key, upload_id, num + 1, data.as_slice()).await?;
        Ok((part, crc))
    })
    .await;
    match res {
        Ok((part, crc)) => {
            tracing::debug!("copied data of {} part {} in {:?}", key, num, started.elapsed());
            ctx.counters.copied_bytes.add(size);
            Ok((part, crc))
        }
        Err(err) => {
            tracing::warn!("failed to copy data of {} part {}: {:#}", key, num, err);
            Err(err.context(format!("part {}", num)))
        }
    }
}

/// One part of the parent upload, produced either by a buffered re-upload or
/// by staging an intermediate multipart object and copying it server-side.
async fn copy_range(
    ctx: &Arc<SyncContext>,
    key: &str,
    off: u64,
    size: u64,
    upload: &MultipartUpload,
    num: u32,
    cancel: &CancellationToken,
    cal_chksum: bool,
) -> Result<(Part, u32)> {
    let _permit = ctx
        .gate
        .acquire_cancellable(cancel)
        .await
        .map_err(|_| anyhow::Error::from(SyncError::Aborted))?;
    let mp = ctx
        .dst
        .multipart()
        .context("destination lost its multipart capability")?;
    let limits = mp.limits();
    if size <= PART_COPY_MIN || !limits.supports_part_copy {
        return upload_part_buffered(ctx, key, off, size, key, &upload.upload_id, num, cal_chksum)
            .await;
    }

    let tmpkey = format!("{}.part{}", key, num);
    let staged = try_n(3, || mp.create_upload(&tmpkey))
        .await
        .with_context(|| format!("range({},{})", off, size))?;
    let part_size = choose_part_size(&staged, size);
    let n = ((size - 1) / part_size + 1) as u32;
    tracing::debug!(
        "copying data of {} (range: {},{}) as {} parts (size: {}): {}",
        key,
        off,
        size,
        n,
        part_size,
        staged.upload_id
    );
    let mut parts = Vec::with_capacity(n as usize);
    let mut staged_crc = 0u32;
    let mut first = true;
    for i in 0..n {
        let sz = if i == n - 1 {
            size - u64::from(i) * part_size
        } else {
            part_size
        };
        if cancel.is_cancelled() {
            let _ = mp.abort_upload(&tmpkey, &staged.upload_id).await;
            return Err(anyhow::Error::from(SyncError::Aborted));
        }
        match upload_part_buffered(
            ctx,
            key,
            off + u64::from(i) * part_size,
            sz,
            &tmpkey,
            &staged.upload_id,
            i,
            cal_chksum,
        )
        .await
        {
            Ok((part, crc)) => {
                parts.push(part);
                if cal_chksum {
                    if first {
                        staged_crc = crc;
                        first = false;
                    } else {
                        staged_crc = crc32c::crc32c_combine(staged_crc, crc, sz as usize);
                    }
                }
            }
            Err(err) => {
                let _ = mp.abort_upload(&tmpkey, &staged.upload_id).await;
                return Err(err.context(format!("range({},{})", off, size)));
            }
        }
    }
    if let Err(err) = try_n(3, || mp.complete_upload(&tmpkey, &staged.upload_id, &parts)).await {
        let _ = mp.abort_upload(&tmpkey, &staged.upload_id).await;
        return Err(err.context("multipart"));
    }
    let part = try_n(3, || {
        mp.upload_part_copy(key, &upload.upload_id, num + 1, &tmpkey, 0, size)
    })
    .await;
    let _ = ctx.dst.delete(&tmpkey).await;
    part.map(|part| (part, staged_crc))
}

async fn copy_multipart(
    ctx: &Arc<SyncContext>,
    key: &str,
    size: u64,
    upload: MultipartUpload,
    cal_chksum: bool,
) -> Result<u32> {
    let mp = ctx
        .dst
        .multipart()
        .context("destination lost its multipart capability")?;
    let limits = mp.limits();
    if size > limits.max_part_size.saturating_mul(u64::from(upload.max_count)) {
        anyhow::bail!("object size {} is too large to copy", size);
    }
    let part_size = choose_part_size(&upload, size);
    let n = ((size - 1) / part_size + 1) as u32;
    tracing::debug!(
        "copying data of {} as {} parts (size: {}): {}",
        key,
        n,
        part_size,
        upload.upload_id
    );
    let cancel = CancellationToken::new();
    let mut join = JoinSet::new();
    for i in 0..n {
        let sz = if i == n - 1 {
            size - u64::from(i) * part_size
        } else {
            part_size
        };
        let ctx = ctx.clone();
        let key = key.to_string();
        let upload = upload.clone();
        let cancel = cancel.clone();
        join.spawn(async move {
            let res = copy_range(
                &ctx,
                &key,
                u64::from(i) * part_size,
                sz,
                &upload,
                i,
                &cancel,
                cal_chksum,
            )
            .await;
            (i, res, sz)
        });
    }
    let mut parts: Vec<Option<Part>> = vec![None; n as usize];
    let mut chksums = vec![(0u32, 0u64); n as usize];
    let mut first_err = None;
    while let Some(joined) = join.join_next().await {
        let (i, res, sz) = joined?;
        match res {
            Ok((part, crc)) => {
                parts[i as usize] = Some(part);
                chksums[i as usize] = (crc, sz);
            }
            Err(err) => {
                cancel.cancel();
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    let res = match first_err {
        None => {
            let parts: Vec<Part> = parts.into_iter().map(|p| p.unwrap()).collect();
            try_n(3, || mp.complete_upload(key, &upload.upload_id, &parts)).await
        }
        Some(err) => Err(err),
    };
    if let Err(err) = res {
        let _ = mp.abort_upload(key, &upload.upload_id).await;
        return Err(err.context("multipart"));
    }
    if cal_chksum {
        Ok(combine(&chksums))
    } else {
        Ok(0)
    }
}

/// One in-order chunk of a parallel download. Holding the window permit
/// until the chunk is fully consumed bounds the number of buffers alive.
struct Chunk {
    buf: SizedBuf,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Ordered byte stream assembled from parallel ranged GETs.
pub(crate) struct ChunkStream {
    rx: tokio::sync::mpsc::Receiver<std::io::Result<Chunk>>,
    current: Option<(Chunk, usize)>,
}

impl AsyncRead for ChunkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some((chunk, pos)) = &mut this.current {
                let data = &chunk.buf.as_slice()[*pos..];
                let n = data.len().min(out.remaining());
                out.put_slice(&data[..n]);
                *pos += n;
                if *pos == chunk.buf.len() {
                    this.current = None;
                }
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if chunk.buf.is_empty() {
                        continue;
                    }
                    this.current = Some((chunk, 0));
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Fetch fixed-size chunks of `key` in gate-bounded parallelism and
/// re-serialize them in order.
pub(crate) fn parallel_download(ctx: &Arc<SyncContext>, key: &str, size: u64) -> ChunkStream {
    let n = (size - 1) / DOWNLOAD_BUF_SIZE + 1;
    let window = Arc::new(tokio::sync::Semaphore::new(ctx.config.threads.max(1)));
    let (chunk_tx, chunk_rx) = tokio::sync::mpsc::channel::<(u64, Result<SizedBuf>, tokio::sync::OwnedSemaphorePermit)>(
        ctx.config.threads.max(1),
    );
    let (out_tx, out_rx) = tokio::sync::mpsc::channel::<std::io::Result<Chunk>>(1);

    // fetchers, admitted by the window so at most `threads` buffers exist
    {
        let ctx = ctx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let mut fetchers = JoinSet::new();
            for i in 0..n {
                let Ok(permit) = window.clone().acquire_owned().await else {
                    break;
                };
                let sz = if i == n - 1 {
                    size - i * DOWNLOAD_BUF_SIZE
                } else {
                    DOWNLOAD_BUF_SIZE
                };
                let ctx = ctx.clone();
                let key = key.clone();
                let chunk_tx = chunk_tx.clone();
                fetchers.spawn(async move {
                    let res = fetch_chunk(&ctx, &key, i * DOWNLOAD_BUF_SIZE, sz).await;
                    let _ = chunk_tx.send((i, res, permit)).await;
                });
            }
            while fetchers.join_next().await.is_some() {}
        });
    }

    // reorderer
    tokio::spawn(async move {
        let mut chunk_rx = chunk_rx;
        let mut parked: std::collections::BTreeMap<u64, Chunk> = std::collections::BTreeMap::new();
        let mut next = 0u64;
        while next < n {
            let Some((i, res, permit)) = chunk_rx.recv().await else {
                break;
            };
            match res {
                Ok(buf) => {
                    parked.insert(i, Chunk { buf, _permit: permit });
                }
                Err(err) => {
                    let _ = out_tx
                        .send(Err(std::io::Error::other(format!("chunk {}: {:#}", i, err))))
                        .await;
                    return;
                }
            }
            while let Some(chunk) = parked.remove(&next) {
                if out_tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
                next += 1;
            }
        }
    });

    ChunkStream {
        rx: out_rx,
        current: None,
    }
}

async fn fetch_chunk(ctx: &Arc<SyncContext>, key: &str, off: u64, size: u64) -> Result<SizedBuf> {
    try_n(3, || async {
        ctx.bw_wait(size).await;
        let _permit = ctx.gate.acquire().await;
        let mut buf = ctx.part_pool.acquire(size as usize);
        let mut reader = ctx.src.get(key, off, Some(size)).await?;
        reader.read_exact(buf.as_mut_slice()).await?;
        Ok(buf)
    })
    .await
    .with_context(|| format!("download range({},{})", off, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mem::MemStore;
    use crate::store::Limits;
    use std::time::UNIX_EPOCH;

    fn ctx_with(src: Arc<MemStore>, dst: Arc<MemStore>, config: Config) -> Arc<SyncContext> {
        SyncContext::new(src, dst, config)
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        use rand::RngCore;
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[tokio::test]
    async fn small_copy_roundtrip_with_checksum() -> Result<()> {
        let src = Arc::new(MemStore::new("src"));
        let dst = Arc::new(MemStore::new("dst"));
        src.insert("a", b"hello", UNIX_EPOCH);
        let ctx = ctx_with(src, dst.clone(), Config::default());
        let crc = copy_data(&ctx, "a", 5, true).await?;
        assert_eq!(dst.data("a").unwrap(), b"hello");
        assert_eq!(crc, crc32c::crc32c(b"hello"));
        assert_eq!(ctx.counters.copied_bytes.get(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn multipart_copy_combines_part_checksums() -> Result<()> {
        let src = Arc::new(MemStore::new("src"));
        let dst = Arc::new(
            MemStore::new("dst").with_limits(Limits {
                min_part_size: 4 << 20,
                max_part_count: 100,
                max_part_size: 1 << 30,
                supports_part_copy: false,
            }),
        );
        let data = random_bytes((MAX_BLOCK + 123_457) as usize);
        src.insert("big", &data, UNIX_EPOCH);
        let ctx = ctx_with(src, dst.clone(), Config::default());
        let crc = copy_data(&ctx, "big", data.len() as u64, true).await?;
        assert_eq!(dst.data("big").unwrap(), data);
        assert_eq!(crc, crc32c::crc32c(&data));
        assert_eq!(dst.pending_uploads(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn multipart_copy_via_staged_part_copy() -> Result<()> {
        let src = Arc::new(MemStore::new("src"));
        let dst = Arc::new(
            MemStore::new("dst").with_limits(Limits {
                // force ranges above PART_COPY_MIN so staging kicks in
                min_part_size: PART_COPY_MIN + (1 << 20),
                max_part_count: 10_000,
                max_part_size: 5 << 30,
                supports_part_copy: true,
            }),
        );
        let data = random_bytes((PART_COPY_MIN + (1 << 20) + 4321) as usize * 2);
        src.insert("big", &data, UNIX_EPOCH);
        let ctx = ctx_with(src.clone(), dst.clone(), Config::default());
        let crc = copy_data(&ctx, "big", data.len() as u64, true).await?;
        assert_eq!(dst.data("big").unwrap(), data);
        assert_eq!(crc, crc32c::crc32c(&data));
        assert_eq!(dst.pending_uploads(), 0);
        // staging keys are cleaned up
        assert!(dst.keys().iter().all(|k| !k.contains(".part")));
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_demoted_to_skip() -> Result<()> {
        let src = Arc::new(MemStore::new("src"));
        let dst = Arc::new(MemStore::new("dst"));
        let ctx = ctx_with(src, dst, Config::default());
        let err = copy_data(&ctx, "ghost", 4, false).await.unwrap_err();
        assert!(is_marker(&err, &SyncError::Skipped));
        Ok(())
    }

    #[tokio::test]
    async fn parallel_download_reorders_chunks() -> Result<()> {
        let src = Arc::new(MemStore::new("src"));
        let data = random_bytes((DOWNLOAD_BUF_SIZE * 2 + 999) as usize);
        src.insert("big", &data, UNIX_EPOCH);
        let ctx = ctx_with(src, Arc::new(MemStore::new("dst")), Config::default());
        let mut stream = parallel_download(&ctx, "big", data.len() as u64);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await?;
        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn part_size_respects_count_and_alignment() {
        let upload = MultipartUpload {
            upload_id: "u".into(),
            min_part_size: 5 << 20,
            max_count: 4,
        };
        assert_eq!(choose_part_size(&upload, 10 << 20), 5 << 20);
        // 100 MiB over 4 parts needs 25 MiB parts
        assert_eq!(choose_part_size(&upload, 100 << 20), 25 << 20);
        // non-aligned sizes round the part up to a whole MiB
        let size = (100 << 20) + 5;
        let part = choose_part_size(&upload, size);
        assert_eq!(part % (1 << 20), 0);
        assert!(part * 4 >= size);
    }
}
