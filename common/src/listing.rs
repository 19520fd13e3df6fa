//! Paginated listing of a store over a key range, emitted as a sorted stream.
//!
//! The stream is strictly ascending; an out-of-order page or a permanently
//! failed page pushes one `Err` and closes the channel, which the consumers
//! treat as fatal for the whole sync.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::object::ObjectEntry;
use crate::retry::{is_marker, SyncError};
use crate::store::ObjectStore;

/// Maximum keys per listing request.
pub const MAX_RESULTS: usize = 1000;

const PAGE_RETRIES: u32 = 3;
const PAGE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Stream every key in `[start, end]` under `prefix`.
pub async fn list_all(
    store: Arc<dyn ObjectStore>,
    prefix: &str,
    start: &str,
    end: &str,
    follow_links: bool,
) -> Result<mpsc::Receiver<Result<ObjectEntry>>> {
    let started = std::time::Instant::now();
    tracing::debug!(
        "iterating objects from {} with prefix {:?} start {:?}",
        store.uri(),
        prefix,
        start
    );
    let (tx, rx) = mpsc::channel(MAX_RESULTS * 10);

    // The paged list API excludes the marker key, so when the start key names
    // an existing object it is probed separately and emitted first.
    if !start.is_empty() && start.starts_with(prefix) {
        if let Ok(obj) = store.head(start).await {
            tracing::debug!(
                "found start key {:?} in {} in {:?}",
                start,
                store.uri(),
                started.elapsed()
            );
            let _ = tx.send(Ok(obj)).await;
        }
    }

    if let Some(streaming) = store.streaming_list() {
        match streaming.list_all(prefix, start, follow_links).await {
            Ok(mut inner) => {
                let end = end.to_string();
                tokio::spawn(async move {
                    while let Some(obj) = inner.recv().await {
                        if !end.is_empty() && obj.key > end {
                            break;
                        }
                        if tx.send(Ok(obj)).await.is_err() {
                            return;
                        }
                    }
                });
                return Ok(rx);
            }
            Err(err) if is_marker(&err, &SyncError::NotSupported) => {}
            Err(err) => return Err(err),
        }
    }

    let first_page = store
        .list(prefix, start, "", "", MAX_RESULTS, follow_links)
        .await
        .with_context(|| format!("can't list {}", store.uri()))?;
    tracing::debug!(
        "found {} objects from {} in {:?}",
        first_page.entries.len(),
        store.uri(),
        started.elapsed()
    );

    let prefix = prefix.to_string();
    let mut marker = start.to_string();
    let end = end.to_string();
    tokio::spawn(async move {
        let mut objs = first_page.entries;
        let mut has_more = first_page.has_more;
        let mut next_token = first_page.next_token;
        let mut lastkey = String::new();
        let mut first = true;
        'pages: loop {
            for obj in objs.drain(..) {
                let key = obj.key.clone();
                if !first && key <= lastkey {
                    tracing::error!(
                        "the keys are out of order: marker {:?}, last {:?} current {:?}",
                        marker,
                        lastkey,
                        key
                    );
                    let _ = tx.send(Err(anyhow::Error::from(SyncError::ListingFailed))).await;
                    break 'pages;
                }
                if !end.is_empty() && key > end {
                    break 'pages;
                }
                lastkey = key;
                first = false;
                if tx.send(Ok(obj)).await.is_err() {
                    break 'pages;
                }
            }
            if !has_more {
                break;
            }
            marker = lastkey.clone();
            let page_start = std::time::Instant::now();
            tracing::debug!(
                "continue listing objects from {} marker {:?}",
                store.uri(),
                marker
            );
            let mut attempt = 0;
            let page = loop {
                match store
                    .list(&prefix, &marker, &next_token, "", MAX_RESULTS, follow_links)
                    .await
                {
                    Ok(page) => break Some(page),
                    Err(err) => {
                        attempt += 1;
                        if attempt > PAGE_RETRIES {
                            tracing::error!(
                                "fail to list after {:?}: {:#}",
                                marker,
                                err
                            );
                            break None;
                        }
                        tracing::warn!("fail to list: {:#}, retry again", err);
                        tokio::time::sleep(PAGE_RETRY_DELAY).await;
                    }
                }
            };
            let Some(page) = page else {
                let _ = tx.send(Err(anyhow::Error::from(SyncError::ListingFailed))).await;
                break;
            };
            tracing::debug!(
                "found {} objects from {} in {:?}",
                page.entries.len(),
                store.uri(),
                page_start.elapsed()
            );
            objs = page.entries;
            has_more = page.has_more;
            next_token = page.next_token;
            // workaround for stores that include the marker in the next page
            if objs.first().map(|o| o.key == marker).unwrap_or(false) {
                objs.remove(0);
            }
        }
    });
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use crate::store::ListPage;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::UNIX_EPOCH;

    async fn drain(
        mut rx: mpsc::Receiver<Result<ObjectEntry>>,
    ) -> (Vec<String>, bool) {
        let mut keys = Vec::new();
        let mut failed = false;
        while let Some(res) = rx.recv().await {
            match res {
                Ok(obj) => keys.push(obj.key),
                Err(_) => failed = true,
            }
        }
        (keys, failed)
    }

    #[tokio::test]
    async fn streams_pages_in_order() -> Result<()> {
        let store = Arc::new(MemStore::new("t"));
        let mut expect = Vec::new();
        for i in 0..2500 {
            let key = format!("k{:05}", i);
            store.insert(&key, b"x", UNIX_EPOCH);
            expect.push(key);
        }
        let rx = list_all(store, "", "", "", true).await?;
        let (keys, failed) = drain(rx).await;
        assert!(!failed);
        assert_eq!(keys, expect);
        Ok(())
    }

    #[tokio::test]
    async fn start_key_is_probed_and_range_bounded() -> Result<()> {
        let store = Arc::new(MemStore::new("t"));
        for key in ["a", "b", "c", "d"] {
            store.insert(key, b"x", UNIX_EPOCH);
        }
        let rx = list_all(store, "", "b", "c", true).await?;
        let (keys, failed) = drain(rx).await;
        assert!(!failed);
        assert_eq!(keys, ["b", "c"]);
        Ok(())
    }

    /// Store that feeds scripted pages; `Err` entries in the script become
    /// page failures.
    struct ScriptedStore {
        pages: Mutex<Vec<Result<ListPage, ()>>>,
    }

    #[async_trait]
    impl crate::store::ObjectStore for ScriptedStore {
        fn uri(&self) -> String {
            "mem://scripted/".to_string()
        }

        async fn head(&self, key: &str) -> Result<ObjectEntry> {
            anyhow::bail!("no such key: {}", key)
        }

        async fn list(
            &self,
            _prefix: &str,
            _marker: &str,
            _token: &str,
            _delimiter: &str,
            _limit: usize,
            _follow_links: bool,
        ) -> Result<ListPage> {
            let mut pages = self.pages.lock().unwrap();
            match pages.remove(0) {
                Ok(page) => Ok(page),
                Err(()) => anyhow::bail!("listing blew up"),
            }
        }

        async fn get(&self, _: &str, _: u64, _: Option<u64>) -> Result<crate::store::Reader> {
            unimplemented!()
        }

        async fn put(&self, _: &str, _: crate::store::Reader) -> Result<()> {
            unimplemented!()
        }

        async fn delete(&self, _: &str) -> Result<()> {
            unimplemented!()
        }
    }

    fn page(keys: &[&str], has_more: bool) -> ListPage {
        ListPage {
            entries: keys
                .iter()
                .map(|k| ObjectEntry::new(*k, 1, UNIX_EPOCH))
                .collect(),
            has_more,
            next_token: String::new(),
        }
    }

    #[tokio::test]
    async fn out_of_order_page_terminates_stream() -> Result<()> {
        let store = Arc::new(ScriptedStore {
            pages: Mutex::new(vec![Ok(page(&["a", "b"], true)), Ok(page(&["b", "a"], false))]),
        });
        let rx = list_all(store, "", "", "", true).await?;
        let (keys, failed) = drain(rx).await;
        // "b" from the second page equals the marker and is elided; "a" breaks order
        assert_eq!(keys, ["a", "b"]);
        assert!(failed);
        Ok(())
    }

    #[tokio::test]
    async fn page_failures_retry_then_terminate() -> Result<()> {
        let store = Arc::new(ScriptedStore {
            pages: Mutex::new(vec![
                Ok(page(&["a"], true)),
                Err(()),
                Ok(page(&["b"], false)),
            ]),
        });
        let rx = list_all(store.clone(), "", "", "", true).await?;
        let (keys, failed) = drain(rx).await;
        assert_eq!(keys, ["a", "b"]);
        assert!(!failed);

        // four consecutive failures exhaust the retries
        let store = Arc::new(ScriptedStore {
            pages: Mutex::new(vec![
                Ok(page(&["a"], true)),
                Err(()),
                Err(()),
                Err(()),
                Err(()),
            ]),
        });
        let rx = list_all(store, "", "", "", true).await?;
        let (keys, failed) = drain(rx).await;
        assert_eq!(keys, ["a"]);
        assert!(failed);
        Ok(())
    }
}
