//! In-memory object store. Capability-complete (multipart, symlinks, POSIX
//! attrs, mtime), so it backs the test suite and doubles as the `mem://`
//! scheme for ad-hoc runs.

use std::collections::{BTreeMap, HashMap};
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::object::{FileAttrs, ObjectEntry};
use crate::store::{
    AttrStore, Limits, ListPage, MtimeStore, MultipartStore, MultipartUpload, ObjectStore, Part,
    Reader, SymlinkStore,
};

#[derive(Debug, Clone)]
struct MemObject {
    data: Vec<u8>,
    mtime: SystemTime,
    attrs: Option<FileAttrs>,
    symlink: Option<String>,
}

#[derive(Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, MemObject>,
    uploads: HashMap<String, PendingUpload>,
}

pub struct MemStore {
    name: String,
    limits: Limits,
    next_upload: AtomicU64,
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limits: Limits {
                min_part_size: 5 << 20,
                max_part_count: 10_000,
                max_part_size: 5 << 30,
                supports_part_copy: true,
            },
            next_upload: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Override multipart limits, mostly so tests can force small parts.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Insert an object directly; fixture helper.
    pub fn insert(&self, key: &str, data: &[u8], mtime: SystemTime) {
        self.inner.lock().unwrap().objects.insert(
            key.to_string(),
            MemObject {
                data: data.to_vec(),
                mtime,
                attrs: None,
                symlink: None,
            },
        );
    }

    /// Insert an object with POSIX attributes; fixture helper.
    pub fn insert_with_attrs(&self, key: &str, data: &[u8], mtime: SystemTime, attrs: FileAttrs) {
        self.inner.lock().unwrap().objects.insert(
            key.to_string(),
            MemObject {
                data: data.to_vec(),
                mtime,
                attrs: Some(attrs),
                symlink: None,
            },
        );
    }

    /// Flip one byte of a stored object; used by corruption tests.
    pub fn corrupt(&self, key: &str, offset: usize) {
        let mut inner = self.inner.lock().unwrap();
        let obj = inner.objects.get_mut(key).expect("corrupt missing key");
        obj.data[offset] ^= 0xff;
    }

    pub fn data(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn attrs_of(&self, key: &str) -> Option<FileAttrs> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(key)
            .and_then(|o| o.attrs.clone())
    }

    pub fn mtime_of(&self, key: &str) -> Option<SystemTime> {
        self.inner.lock().unwrap().objects.get(key).map(|o| o.mtime)
    }

    /// Number of unfinished multipart uploads; leak detector for tests.
    pub fn pending_uploads(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }

    fn entry_of(key: &str, obj: &MemObject) -> ObjectEntry {
        let mut entry = ObjectEntry::new(key, obj.data.len() as u64, obj.mtime);
        entry.is_symlink = obj.symlink.is_some();
        entry.attrs = obj.attrs.clone();
        entry
    }

    fn not_found(key: &str) -> anyhow::Error {
        anyhow::Error::from(Error::new(ErrorKind::NotFound, format!("no such key: {}", key)))
    }
}

/// Process-wide registry so `mem://name` resolves to one shared namespace.
pub fn shared(name: &str) -> std::sync::Arc<MemStore> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, std::sync::Arc<MemStore>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    registry
        .lock()
        .unwrap()
        .entry(name.to_string())
        .or_insert_with(|| std::sync::Arc::new(MemStore::new(name)))
        .clone()
}

#[async_trait]
impl ObjectStore for MemStore {
    fn uri(&self) -> String {
        format!("mem://{}/", self.name)
    }

    async fn head(&self, key: &str) -> Result<ObjectEntry> {
        let inner = self.inner.lock().unwrap();
        let obj = inner.objects.get(key).ok_or_else(|| Self::not_found(key))?;
        Ok(Self::entry_of(key, obj))
    }

    async fn list(
        &self,
        prefix: &str,
        marker: &str,
        _token: &str,
        delimiter: &str,
        limit: usize,
        _follow_links: bool,
    ) -> Result<ListPage> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<ObjectEntry> = Vec::new();
        let mut last_prefix: Option<String> = None;
        let mut has_more = false;
        for (key, obj) in inner.objects.range(marker.to_string()..) {
            if key.as_str() <= marker {
                continue;
            }
            if !key.starts_with(prefix) {
                if key.as_str() > prefix && !prefix.is_empty() {
                    break;
                }
                continue;
            }
            if entries.len() >= limit {
                has_more = true;
                break;
            }
            if !delimiter.is_empty() {
                if let Some(pos) = key[prefix.len()..].find(delimiter) {
                    let common = format!("{}{}", prefix, &key[prefix.len()..prefix.len() + pos + 1]);
                    // rolled-up groups at or before the marker were already reported
                    if common.as_str() <= marker || last_prefix.as_deref() == Some(common.as_str())
                    {
                        continue;
                    }
                    last_prefix = Some(common.clone());
                    entries.push(ObjectEntry::new(common, 0, obj.mtime));
                    continue;
                }
            }
            entries.push(Self::entry_of(key, obj));
        }
        Ok(ListPage {
            entries,
            has_more,
            next_token: String::new(),
        })
    }

    async fn get(&self, key: &str, off: u64, len: Option<u64>) -> Result<Reader> {
        let inner = self.inner.lock().unwrap();
        let obj = inner.objects.get(key).ok_or_else(|| Self::not_found(key))?;
        let off = off as usize;
        if off > obj.data.len() {
            anyhow::bail!("range start {} beyond object size {}", off, obj.data.len());
        }
        let end = match len {
            Some(len) => (off + len as usize).min(obj.data.len()),
            None => obj.data.len(),
        };
        Ok(Box::new(std::io::Cursor::new(obj.data[off..end].to_vec())))
    }

    async fn put(&self, key: &str, mut data: Reader) -> Result<()> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)
            .await
            .with_context(|| format!("reading data for {}", key))?;
        self.inner.lock().unwrap().objects.insert(
            key.to_string(),
            MemObject {
                data: buf,
                mtime: SystemTime::now(),
                attrs: None,
                symlink: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().unwrap().objects.remove(key);
        Ok(())
    }

    fn multipart(&self) -> Option<&dyn MultipartStore> {
        Some(self)
    }

    fn symlinks(&self) -> Option<&dyn SymlinkStore> {
        Some(self)
    }

    fn attrs(&self) -> Option<&dyn AttrStore> {
        Some(self)
    }

    fn mtimes(&self) -> Option<&dyn MtimeStore> {
        Some(self)
    }
}

#[async_trait]
impl MultipartStore for MemStore {
    fn limits(&self) -> Limits {
        self.limits
    }

    async fn create_upload(&self, key: &str) -> Result<MultipartUpload> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::Relaxed));
        self.inner.lock().unwrap().uploads.insert(
            id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(MultipartUpload {
            upload_id: id,
            min_part_size: self.limits.min_part_size,
            max_count: self.limits.max_part_count,
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_num: u32,
        data: &[u8],
    ) -> Result<Part> {
        let mut inner = self.inner.lock().unwrap();
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .with_context(|| format!("unknown upload {} for {}", upload_id, key))?;
        upload.parts.insert(part_num, data.to_vec());
        Ok(Part {
            num: part_num,
            etag: format!("{:08x}", crc32c::crc32c(data)),
        })
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_num: u32,
        src_key: &str,
        off: u64,
        len: u64,
    ) -> Result<Part> {
        let mut inner = self.inner.lock().unwrap();
        let data = {
            let obj = inner
                .objects
                .get(src_key)
                .ok_or_else(|| Self::not_found(src_key))?;
            let off = off as usize;
            let end = (off + len as usize).min(obj.data.len());
            obj.data[off..end].to_vec()
        };
        let etag = format!("{:08x}", crc32c::crc32c(&data));
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .with_context(|| format!("unknown upload {} for {}", upload_id, key))?;
        upload.parts.insert(part_num, data);
        Ok(Part {
            num: part_num,
            etag,
        })
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let upload = inner
            .uploads
            .remove(upload_id)
            .with_context(|| format!("unknown upload {} for {}", upload_id, key))?;
        anyhow::ensure!(upload.key == key, "upload {} belongs to {}", upload_id, upload.key);
        let mut data = Vec::new();
        for part in parts {
            let piece = upload
                .parts
                .get(&part.num)
                .with_context(|| format!("missing part {} of {}", part.num, key))?;
            data.extend_from_slice(piece);
        }
        inner.objects.insert(
            key.to_string(),
            MemObject {
                data,
                mtime: SystemTime::now(),
                attrs: None,
                symlink: None,
            },
        );
        Ok(())
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.inner.lock().unwrap().uploads.remove(upload_id);
        Ok(())
    }
}

#[async_trait]
impl SymlinkStore for MemStore {
    async fn read_link(&self, key: &str) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        let obj = inner.objects.get(key).ok_or_else(|| Self::not_found(key))?;
        obj.symlink
            .clone()
            .with_context(|| format!("{} is not a symlink", key))
    }

    async fn symlink(&self, target: &str, key: &str) -> Result<()> {
        self.inner.lock().unwrap().objects.insert(
            key.to_string(),
            MemObject {
                data: target.as_bytes().to_vec(),
                mtime: SystemTime::now(),
                attrs: None,
                symlink: Some(target.to_string()),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl AttrStore for MemStore {
    async fn chown(&self, key: &str, owner: &str, group: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let obj = inner
            .objects
            .get_mut(key)
            .ok_or_else(|| Self::not_found(key))?;
        let attrs = obj.attrs.get_or_insert(FileAttrs {
            mode: 0o644,
            owner: String::new(),
            group: String::new(),
        });
        attrs.owner = owner.to_string();
        attrs.group = group.to_string();
        Ok(())
    }

    async fn chmod(&self, key: &str, mode: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let obj = inner
            .objects
            .get_mut(key)
            .ok_or_else(|| Self::not_found(key))?;
        let attrs = obj.attrs.get_or_insert(FileAttrs {
            mode: 0,
            owner: String::new(),
            group: String::new(),
        });
        attrs.mode = mode;
        Ok(())
    }
}

#[async_trait]
impl MtimeStore for MemStore {
    async fn set_mtime(&self, key: &str, mtime: SystemTime) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let obj = inner
            .objects
            .get_mut(key)
            .ok_or_else(|| Self::not_found(key))?;
        obj.mtime = mtime;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[tokio::test]
    async fn list_is_sorted_and_paged() -> Result<()> {
        let store = MemStore::new("t");
        for key in ["b", "a", "c/d", "c/e"] {
            store.insert(key, b"x", UNIX_EPOCH);
        }
        let page = store.list("", "", "", "", 3, false).await?;
        let keys: Vec<_> = page.entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, ["a", "b", "c/d"]);
        assert!(page.has_more);
        let page = store.list("", "c/d", "", "", 10, false).await?;
        let keys: Vec<_> = page.entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, ["c/e"]);
        assert!(!page.has_more);
        Ok(())
    }

    #[tokio::test]
    async fn delimited_list_groups_prefixes() -> Result<()> {
        let store = MemStore::new("t");
        for key in ["a", "dir/x", "dir/y", "other/z"] {
            store.insert(key, b"x", UNIX_EPOCH);
        }
        let page = store.list("", "", "", "/", 100, false).await?;
        let keys: Vec<_> = page.entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, ["a", "dir/", "other/"]);
        assert!(page.entries[1].is_dir);
        Ok(())
    }

    #[tokio::test]
    async fn ranged_get() -> Result<()> {
        let store = MemStore::new("t");
        store.insert("k", b"hello world", UNIX_EPOCH);
        let mut reader = store.get("k", 6, Some(5)).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        assert_eq!(buf, b"world");
        Ok(())
    }

    #[tokio::test]
    async fn multipart_roundtrip() -> Result<()> {
        let store = MemStore::new("t");
        let mp = store.multipart().unwrap();
        let upload = mp.create_upload("big").await?;
        let p1 = mp.upload_part("big", &upload.upload_id, 1, b"hello ").await?;
        let p2 = mp.upload_part("big", &upload.upload_id, 2, b"world").await?;
        mp.complete_upload("big", &upload.upload_id, &[p1, p2]).await?;
        assert_eq!(store.data("big").unwrap(), b"hello world");
        assert_eq!(store.pending_uploads(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn part_copy_reads_source_range() -> Result<()> {
        let store = MemStore::new("t");
        store.insert("src", b"0123456789", UNIX_EPOCH);
        let mp = store.multipart().unwrap();
        let upload = mp.create_upload("dst").await?;
        let part = mp
            .upload_part_copy("dst", &upload.upload_id, 1, "src", 2, 4)
            .await?;
        mp.complete_upload("dst", &upload.upload_id, &[part]).await?;
        assert_eq!(store.data("dst").unwrap(), b"2345");
        Ok(())
    }
}
