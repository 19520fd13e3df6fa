//! Object-store driver interface.
//!
//! The engine talks to storage backends through [`ObjectStore`] plus a set of
//! optional capability traits discovered once at construction. A store that
//! cannot do something either omits the capability or returns
//! [`SyncError::NotSupported`](crate::retry::SyncError) from the operation,
//! and the engine falls back to an alternative path.

use anyhow::Result;
use async_trait::async_trait;

use crate::object::ObjectEntry;

pub type Reader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// One page of a listing.
#[derive(Debug, Default)]
pub struct ListPage {
    /// Entries in ascending key order. In delimited mode, common prefixes
    /// appear as directory entries whose key extends the listed prefix.
    pub entries: Vec<ObjectEntry>,
    pub has_more: bool,
    pub next_token: String,
}

/// Multipart limits advertised by a destination.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub min_part_size: u64,
    pub max_part_count: u32,
    pub max_part_size: u64,
    pub supports_part_copy: bool,
}

#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub min_part_size: u64,
    pub max_count: u32,
}

#[derive(Debug, Clone)]
pub struct Part {
    pub num: u32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `scheme://location` form used in logs and for scheme policy lookups.
    fn uri(&self) -> String;

    async fn head(&self, key: &str) -> Result<ObjectEntry>;

    /// One page of keys with `prefix`, strictly after `marker`. An empty
    /// `delimiter` lists flat; `"/"` groups common prefixes. Stores without
    /// delimiter support return `NotSupported` for non-empty delimiters.
    async fn list(
        &self,
        prefix: &str,
        marker: &str,
        token: &str,
        delimiter: &str,
        limit: usize,
        follow_links: bool,
    ) -> Result<ListPage>;

    /// Ranged read. `len` of `None` reads to the end of the object.
    async fn get(&self, key: &str, off: u64, len: Option<u64>) -> Result<Reader>;

    async fn put(&self, key: &str, data: Reader) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    fn multipart(&self) -> Option<&dyn MultipartStore> {
        None
    }

    fn symlinks(&self) -> Option<&dyn SymlinkStore> {
        None
    }

    fn attrs(&self) -> Option<&dyn AttrStore> {
        None
    }

    fn mtimes(&self) -> Option<&dyn MtimeStore> {
        None
    }

    fn streaming_list(&self) -> Option<&dyn StreamingList> {
        None
    }
}

#[async_trait]
pub trait MultipartStore: Send + Sync {
    fn limits(&self) -> Limits;
    async fn create_upload(&self, key: &str) -> Result<MultipartUpload>;
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_num: u32,
        data: &[u8],
    ) -> Result<Part>;
    /// A part whose data is a byte range of another object on the same store.
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_num: u32,
        src_key: &str,
        off: u64,
        len: u64,
    ) -> Result<Part>;
    async fn complete_upload(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()>;
    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()>;
}

#[async_trait]
pub trait SymlinkStore: Send + Sync {
    async fn read_link(&self, key: &str) -> Result<String>;
    async fn symlink(&self, target: &str, key: &str) -> Result<()>;
}

#[async_trait]
pub trait AttrStore: Send + Sync {
    async fn chown(&self, key: &str, owner: &str, group: &str) -> Result<()>;
    async fn chmod(&self, key: &str, mode: u32) -> Result<()>;
}

#[async_trait]
pub trait MtimeStore: Send + Sync {
    async fn set_mtime(&self, key: &str, mtime: std::time::SystemTime) -> Result<()>;
}

/// Streaming listing over the full key range, for stores that can do better
/// than page-by-page.
#[async_trait]
pub trait StreamingList: Send + Sync {
    async fn list_all(
        &self,
        prefix: &str,
        marker: &str,
        follow_links: bool,
    ) -> Result<tokio::sync::mpsc::Receiver<ObjectEntry>>;
}

pub fn scheme_of(store: &dyn ObjectStore) -> String {
    let uri = store.uri();
    uri.split("://").next().unwrap_or_default().to_string()
}

/// Sources that stream a single object fast enough that a parallel ranged
/// download buys nothing.
pub fn fast_stream_read(scheme: &str) -> bool {
    matches!(scheme, "file" | "hdfs" | "jfs" | "gluster")
}

/// Destinations that accept a PUT of unknown length from a streaming reader.
pub fn stream_write(scheme: &str) -> bool {
    matches!(
        scheme,
        "file" | "hdfs" | "sftp" | "gs" | "wasb" | "ceph" | "swift" | "webdav" | "jfs" | "gluster"
    )
}

/// Destinations that buffer whole objects in memory.
pub fn read_in_mem(scheme: &str) -> bool {
    matches!(
        scheme,
        "mem" | "etcd" | "redis" | "tikv" | "mysql" | "postgres" | "sqlite3"
    )
}

/// Stores with filesystem semantics (directories are real, empty keys are
/// meaningless at the bucket root).
pub fn is_filesystem(scheme: &str) -> bool {
    matches!(scheme, "file" | "hdfs" | "sftp" | "jfs" | "gluster" | "nfs")
}

/// Build a store from a `scheme://location` URI. `mem://` namespaces are
/// process-wide so two URIs with the same name share objects.
pub fn from_uri(uri: &str) -> Result<std::sync::Arc<dyn ObjectStore>> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("{:?} is not a scheme://location URI", uri))?;
    match scheme {
        "mem" => Ok(crate::mem::shared(rest.trim_end_matches('/'))),
        "file" => Ok(std::sync::Arc::new(crate::fs::FileStore::new(
            rest.trim_end_matches('/').to_string(),
        ))),
        other => anyhow::bail!("unsupported store scheme {:?}", other),
    }
}
