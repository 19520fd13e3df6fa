//! Local filesystem driver (`file://`).
//!
//! Listing is flat: the tree is walked, keyed relative to the root with `/`
//! separators, and sorted. Delimited listing reports `NotSupported`, which
//! sends the prefix fan-out down its flat fallback path. Directories appear
//! as zero-size keys ending `/`.

use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::object::{FileAttrs, ObjectEntry};
use crate::retry::SyncError;
use crate::store::{AttrStore, ListPage, MtimeStore, ObjectStore, Reader, SymlinkStore};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|seg| seg == "..") {
            bail!("key {:?} escapes the store root", key);
        }
        Ok(self.root.join(key.trim_end_matches('/')))
    }

    fn entry_from_meta(key: String, meta: &std::fs::Metadata, symlink: bool) -> ObjectEntry {
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let size = if meta.is_dir() { 0 } else { meta.len() };
        let mut entry = ObjectEntry::new(key, size, mtime);
        entry.is_dir = meta.is_dir();
        entry.is_symlink = symlink;
        entry.attrs = Some(FileAttrs {
            mode: meta.permissions().mode() & 0o7777,
            owner: meta.uid().to_string(),
            group: meta.gid().to_string(),
        });
        entry
    }

    fn walk(root: &Path, follow_links: bool) -> Result<Vec<ObjectEntry>> {
        let mut out = Vec::new();
        let mut stack = vec![PathBuf::new()];
        while let Some(rel) = stack.pop() {
            let dir = root.join(&rel);
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let rel_child = if rel.as_os_str().is_empty() {
                    PathBuf::from(name.as_ref())
                } else {
                    rel.join(name.as_ref())
                };
                let key = rel_child.to_string_lossy().replace('\\', "/");
                let meta = entry.path().symlink_metadata()?;
                if meta.is_dir() {
                    out.push(Self::entry_from_meta(format!("{}/", key), &meta, false));
                    stack.push(rel_child);
                } else if meta.is_symlink() {
                    if follow_links {
                        match entry.path().metadata() {
                            Ok(target) if target.is_dir() => {
                                out.push(Self::entry_from_meta(format!("{}/", key), &target, false))
                            }
                            Ok(target) => out.push(Self::entry_from_meta(key, &target, false)),
                            // broken link, report the link itself
                            Err(_) => out.push(Self::entry_from_meta(key, &meta, true)),
                        }
                    } else {
                        out.push(Self::entry_from_meta(key, &meta, true));
                    }
                } else {
                    out.push(Self::entry_from_meta(key, &meta, false));
                }
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    fn uri(&self) -> String {
        format!("file://{}/", self.root.display())
    }

    async fn head(&self, key: &str) -> Result<ObjectEntry> {
        let path = self.key_path(key)?;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let meta = path
                .symlink_metadata()
                .with_context(|| format!("failed reading metadata from {:?}", path))?;
            Ok(Self::entry_from_meta(key, &meta, meta.is_symlink()))
        })
        .await?
    }

    async fn list(
        &self,
        prefix: &str,
        marker: &str,
        _token: &str,
        delimiter: &str,
        limit: usize,
        follow_links: bool,
    ) -> Result<ListPage> {
        if !delimiter.is_empty() {
            return Err(anyhow::Error::from(SyncError::NotSupported))
                .context("delimited listing on a file store");
        }
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let marker = marker.to_string();
        tokio::task::spawn_blocking(move || {
            let all = Self::walk(&root, follow_links)?;
            let mut entries: Vec<ObjectEntry> = Vec::new();
            let mut has_more = false;
            for entry in all {
                if entry.key.as_str() <= marker.as_str() || !entry.key.starts_with(&prefix) {
                    continue;
                }
                if entries.len() >= limit {
                    has_more = true;
                    break;
                }
                entries.push(entry);
            }
            Ok(ListPage {
                entries,
                has_more,
                next_token: String::new(),
            })
        })
        .await?
    }

    async fn get(&self, key: &str, off: u64, len: Option<u64>) -> Result<Reader> {
        let path = self.key_path(key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("cannot open {:?} for reading", path))?;
        if off > 0 {
            file.seek(std::io::SeekFrom::Start(off))
                .await
                .with_context(|| format!("cannot seek {:?} to {}", path, off))?;
        }
        match len {
            Some(len) => Ok(Box::new(file.take(len))),
            None => Ok(Box::new(file)),
        }
    }

    async fn put(&self, key: &str, mut data: Reader) -> Result<()> {
        let path = self.key_path(key)?;
        if key.ends_with('/') || key.is_empty() {
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("cannot create directory {:?}", path))?;
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {:?}", parent))?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("cannot open {:?} for writing", path))?;
        tokio::io::copy(&mut data, &mut file)
            .await
            .with_context(|| format!("failed copying data to {:?}", path))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        let res = if key.ends_with('/') {
            tokio::fs::remove_dir(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match res {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed removing {:?}", path)),
        }
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
impl SymlinkStore for FileStore {
    async fn read_link(&self, key: &str) -> Result<String> {
        let path = self.key_path(key)?;
        let target = tokio::fs::read_link(&path)
            .await
            .with_context(|| format!("failed reading symlink {:?}", path))?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn symlink(&self, target: &str, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {:?}", parent))?;
        }
        tokio::fs::symlink(target, &path)
            .await
            .with_context(|| format!("failed creating symlink {:?}", path))
    }
}

#[async_trait]
impl AttrStore for FileStore {
    async fn chown(&self, key: &str, owner: &str, group: &str) -> Result<()> {
        let path = self.key_path(key)?;
        let uid: u32 = owner
            .parse()
            .with_context(|| format!("owner {:?} is not a uid", owner))?;
        let gid: u32 = group
            .parse()
            .with_context(|| format!("group {:?} is not a gid", group))?;
        tokio::task::spawn_blocking(move || {
            nix::unistd::chown(
                &path,
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(gid)),
            )
            .map_err(anyhow::Error::from)
        })
        .await?
    }

    async fn chmod(&self, key: &str, mode: u32) -> Result<()> {
        let path = self.key_path(key)?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("cannot set {:?} permissions to {:o}", path, mode))
    }
}

#[async_trait]
impl MtimeStore for FileStore {
    async fn set_mtime(&self, key: &str, mtime: SystemTime) -> Result<()> {
        let path = self.key_path(key)?;
        tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(mtime))
                .with_context(|| format!("cannot set mtime of {:?}", path))
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Result<(tempfile::TempDir, FileStore)> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_path_buf();
        tokio::fs::write(root.join("0.txt"), "0").await?;
        tokio::fs::create_dir(root.join("sub")).await?;
        tokio::fs::write(root.join("sub").join("1.txt"), "11").await?;
        tokio::fs::symlink("0.txt", root.join("link")).await?;
        Ok((dir, FileStore::new(root)))
    }

    #[tokio::test]
    async fn listing_is_sorted_with_dirs() -> Result<()> {
        let (_dir, store) = setup().await?;
        let page = store.list("", "", "", "", 100, false).await?;
        let keys: Vec<_> = page.entries.iter().map(|e| e.key.clone()).collect();
        assert_eq!(keys, ["0.txt", "link", "sub/", "sub/1.txt"]);
        assert!(page.entries[2].is_dir);
        assert!(page.entries[1].is_symlink);
        Ok(())
    }

    #[tokio::test]
    async fn delimited_listing_is_not_supported() -> Result<()> {
        let (_dir, store) = setup().await?;
        let err = store.list("", "", "", "/", 100, false).await.unwrap_err();
        assert!(crate::retry::is_marker(&err, &SyncError::NotSupported));
        Ok(())
    }

    #[tokio::test]
    async fn ranged_get_and_put() -> Result<()> {
        let (_dir, store) = setup().await?;
        store
            .put("new/file", Box::new(std::io::Cursor::new(b"abcdef".to_vec())))
            .await?;
        let mut reader = store.get("new/file", 2, Some(3)).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        assert_eq!(buf, b"cde");
        Ok(())
    }

    #[tokio::test]
    async fn head_of_missing_key_is_not_found() -> Result<()> {
        let (_dir, store) = setup().await?;
        let err = store.head("nope").await.unwrap_err();
        assert!(crate::retry::is_not_found(&err));
        Ok(())
    }
}
