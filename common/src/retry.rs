//! Error taxonomy and the in-place retry loop.

use anyhow::Result;

/// Marker errors the engine dispatches on. These travel inside `anyhow`
/// chains and are recognized with [`is_marker`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The object vanished, was filtered mid-flight, or is otherwise fine to
    /// count as skipped rather than failed.
    #[error("skipped")]
    Skipped,
    /// A symlink pointing outside the synced tree.
    #[error("external link")]
    ExternalLink,
    /// The store cannot perform the requested operation; callers fall back.
    #[error("not supported")]
    NotSupported,
    /// A peer in the same parallel group failed first.
    #[error("aborted")]
    Aborted,
    /// Byte-wise comparison found a difference; converted by the verifier
    /// into an inequality verdict.
    #[error("bytes not equal")]
    BytesNotEqual,
    /// A listing stream died (page failure or out-of-order keys); fatal for
    /// the whole sync.
    #[error("listing failed")]
    ListingFailed,
}

pub fn is_marker(err: &anyhow::Error, marker: &SyncError) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<SyncError>()
            .map(|e| std::mem::discriminant(e) == std::mem::discriminant(marker))
            .unwrap_or(false)
    })
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|e| e.kind() == std::io::ErrorKind::NotFound)
            .unwrap_or(false)
    })
}

/// Transient errno set worth retrying in place.
fn retryable_errno(errno: nix::errno::Errno) -> bool {
    use nix::errno::Errno;
    matches!(
        errno,
        Errno::EAGAIN | Errno::EINTR | Errno::EBUSY | Errno::ETIMEDOUT | Errno::EIO
    )
}

pub fn should_retry(err: &anyhow::Error) -> bool {
    if is_marker(err, &SyncError::Skipped) || is_marker(err, &SyncError::ExternalLink) {
        return false;
    }
    if let Some(raw) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<std::io::Error>())
        .and_then(|io| io.raw_os_error())
    {
        return retryable_errno(nix::errno::Errno::from_raw(raw));
    }
    true
}

/// Run `f` up to `n` times, sleeping `i²` seconds before attempt `i+1`.
/// Non-retryable errors return immediately.
pub async fn try_n<T, F, Fut>(n: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;
    for i in 0..n {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if !should_retry(&err) {
                    return Err(err);
                }
                tracing::debug!("try {} failed: {:#}", i + 1, err);
                last = Some(err);
            }
        }
        if i + 1 < n {
            tokio::time::sleep(std::time::Duration::from_secs(u64::from(i * i))).await;
        }
    }
    Err(last.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn markers_are_recognized_through_context() {
        let err = anyhow!(SyncError::Skipped).context("while copying a/b");
        assert!(is_marker(&err, &SyncError::Skipped));
        assert!(!is_marker(&err, &SyncError::Aborted));
        assert!(!should_retry(&err));
    }

    #[test]
    fn errno_classification() {
        let transient = anyhow::Error::from(std::io::Error::from_raw_os_error(libc_eio()))
            .context("read failed");
        assert!(should_retry(&transient));
        let permanent = anyhow::Error::from(std::io::Error::from_raw_os_error(
            nix::errno::Errno::ENOENT as i32,
        ));
        assert!(!should_retry(&permanent));
        // non-errno errors default to retryable
        assert!(should_retry(&anyhow!("connection reset mid-flight")));
    }

    fn libc_eio() -> i32 {
        nix::errno::Errno::EIO as i32
    }

    #[tokio::test]
    async fn try_n_stops_on_success() {
        let mut calls = 0;
        let res: Result<u32> = try_n(3, || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 2 {
                    Err(anyhow!("flaky"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 2);
    }

    #[tokio::test]
    async fn try_n_gives_up_immediately_on_skip() {
        let mut calls = 0;
        let res: Result<()> = try_n(3, || {
            calls += 1;
            async { Err(anyhow!(SyncError::Skipped)) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }
}
