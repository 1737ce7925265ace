//! Storage contract consumed by the vault engine, and two backends.
//!
//! Paths are `/`-separated and relative to the backend root. Leading,
//! trailing and repeated separators are ignored; `.` and `..` components
//! are rejected.
//!
//! - [`Storage`] — async file namespace: list, stat, read, write, mkpath, rm
//! - [`LocalStorage`] — a directory on the local filesystem (`tokio::fs`)
//! - [`MemoryStorage`] — an in-process tree, for tests and ephemeral vaults
//! - [`copy_recursive`] / [`remove_recursive`] — tree helpers over any backend

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StorageError;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// One directory entry, as returned by [`Storage::list`] and
/// [`Storage::stat`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    /// Final path component (empty for the root).
    pub name: String,
    pub is_dir: bool,
    /// Size in bytes, when the backend knows it.
    pub size: Option<u64>,
}

/// Asynchronous file namespace.
///
/// `write` requires the parent directory to exist; `rm` removes a file or
/// an empty directory.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entries of the directory at `path`, sorted by name.
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, StorageError>;

    /// Metadata for the entry at `path`.
    async fn stat(&self, path: &str) -> Result<FileEntry, StorageError>;

    /// Full contents of the file at `path`.
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Replace the file at `path` with `data`.
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Create the directory at `path` and any missing ancestors.
    async fn mkpath(&self, path: &str) -> Result<(), StorageError>;

    /// Remove a file or an empty directory.
    async fn rm(&self, path: &str) -> Result<(), StorageError>;
}

/// Normalize a storage path to its components.
///
/// # Errors
///
/// Returns `StorageError::InvalidPath` for `.` or `..` components.
pub fn components(path: &str) -> Result<Vec<&str>, StorageError> {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(StorageError::InvalidPath(path.to_owned()));
    }
    Ok(parts)
}

/// Join a directory path and a name.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

fn normalize(path: &str) -> Result<String, StorageError> {
    Ok(components(path)?.join("/"))
}

fn parent_of(normalized: &str) -> &str {
    normalized.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn name_of(normalized: &str) -> String {
    normalized
        .rsplit_once('/')
        .map_or(normalized, |(_, name)| name)
        .to_owned()
}

// ---------------------------------------------------------------------------
// Tree helpers
// ---------------------------------------------------------------------------

/// Copy the file or directory tree at `src` to `dest`.
///
/// # Errors
///
/// Propagates the first backend error; a partial copy is left in place.
pub async fn copy_recursive(
    storage: &dyn Storage,
    src: &str,
    dest: &str,
) -> Result<(), StorageError> {
    let root = storage.stat(src).await?;
    if !root.is_dir {
        let data = storage.read(src).await?;
        return storage.write(dest, &data).await;
    }

    let mut pending = vec![(src.to_owned(), dest.to_owned())];
    while let Some((from, to)) = pending.pop() {
        storage.mkpath(&to).await?;
        for entry in storage.list(&from).await? {
            let child_from = join(&from, &entry.name);
            let child_to = join(&to, &entry.name);
            if entry.is_dir {
                pending.push((child_from, child_to));
            } else {
                let data = storage.read(&child_from).await?;
                storage.write(&child_to, &data).await?;
            }
        }
    }
    Ok(())
}

/// Remove the file or directory tree at `path`.
///
/// # Errors
///
/// Propagates the first backend error.
pub async fn remove_recursive(storage: &dyn Storage, path: &str) -> Result<(), StorageError> {
    let root = storage.stat(path).await?;
    if !root.is_dir {
        return storage.rm(path).await;
    }

    // Files go first; directories are removed deepest-first afterwards.
    let mut dirs = Vec::new();
    let mut pending = vec![path.to_owned()];
    while let Some(dir) = pending.pop() {
        for entry in storage.list(&dir).await? {
            let child = join(&dir, &entry.name);
            if entry.is_dir {
                pending.push(child);
            } else {
                storage.rm(&child).await?;
            }
        }
        dirs.push(dir);
    }
    for dir in dirs.iter().rev() {
        storage.rm(dir).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Local filesystem backend
// ---------------------------------------------------------------------------

/// Storage rooted at a local directory.
#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Backend rooted at `root`. The directory is not created.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let mut full = self.root.clone();
        for part in components(path)? {
            full.push(part);
        }
        Ok(full)
    }

    fn entry_for(name: String, meta: &std::fs::Metadata) -> FileEntry {
        FileEntry {
            name,
            is_dir: meta.is_dir(),
            size: (!meta.is_dir()).then_some(meta.len()),
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, StorageError> {
        let dir = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(path, e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| StorageError::from_io(path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(Self::entry_for(name, &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileEntry, StorageError> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        Ok(Self::entry_for(name_of(&normalize(path)?), &meta))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let normalized = normalize(path)?;
        if normalized.is_empty() {
            return Err(StorageError::InvalidPath(path.to_owned()));
        }
        let full = self.resolve(&normalized)?;
        let tmp = self.resolve(&join(
            parent_of(&normalized),
            &format!(".{}.tmp", name_of(&normalized)),
        ))?;

        // Write to a sibling temp file, then rename over the target.
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| StorageError::from_io(path, e))?;
        }

        tokio::fs::rename(&tmp, &full)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn mkpath(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))
    }

    async fn rm(&self, path: &str) -> Result<(), StorageError> {
        if normalize(path)?.is_empty() {
            return Err(StorageError::InvalidPath(path.to_owned()));
        }
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        result.map_err(|e| {
            if meta.is_dir() && e.kind() != std::io::ErrorKind::NotFound {
                StorageError::NotEmpty(path.to_owned())
            } else {
                StorageError::from_io(path, e)
            }
        })
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// Storage held entirely in memory. Starts with an empty root directory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl MemoryStorage {
    /// Empty in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StorageError {
        StorageError::Backend("memory storage lock poisoned".into())
    }

    /// Resolve a normalized path; the root always exists as a directory.
    fn lookup<'a>(nodes: &'a BTreeMap<String, Node>, normalized: &str) -> Option<&'a Node> {
        static ROOT: Node = Node::Dir;
        if normalized.is_empty() {
            return Some(&ROOT);
        }
        nodes.get(normalized)
    }

    fn require_dir(
        nodes: &BTreeMap<String, Node>,
        normalized: &str,
        original: &str,
    ) -> Result<(), StorageError> {
        match Self::lookup(nodes, normalized) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(StorageError::NotADirectory(original.to_owned())),
            None => Err(StorageError::NotFound(original.to_owned())),
        }
    }

    fn children<'a>(
        nodes: &'a BTreeMap<String, Node>,
        dir: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Node)> + 'a {
        nodes.iter().filter_map(move |(key, node)| {
            let rest = if dir.is_empty() {
                key.as_str()
            } else {
                key.strip_prefix(dir)?.strip_prefix('/')?
            };
            (!rest.contains('/')).then_some((rest, node))
        })
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, StorageError> {
        let normalized = normalize(path)?;
        let nodes = self.nodes.read().map_err(|_| Self::poisoned())?;
        Self::require_dir(&nodes, &normalized, path)?;

        Ok(Self::children(&nodes, &normalized)
            .map(|(name, node)| FileEntry {
                name: name.to_owned(),
                is_dir: matches!(node, Node::Dir),
                size: match node {
                    Node::Dir => None,
                    Node::File(data) => u64::try_from(data.len()).ok(),
                },
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<FileEntry, StorageError> {
        let normalized = normalize(path)?;
        let nodes = self.nodes.read().map_err(|_| Self::poisoned())?;
        match Self::lookup(&nodes, &normalized) {
            Some(Node::Dir) => Ok(FileEntry {
                name: name_of(&normalized),
                is_dir: true,
                size: None,
            }),
            Some(Node::File(data)) => Ok(FileEntry {
                name: name_of(&normalized),
                is_dir: false,
                size: u64::try_from(data.len()).ok(),
            }),
            None => Err(StorageError::NotFound(path.to_owned())),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let normalized = normalize(path)?;
        let nodes = self.nodes.read().map_err(|_| Self::poisoned())?;
        match Self::lookup(&nodes, &normalized) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(StorageError::InvalidPath(format!("{path} is a directory"))),
            None => Err(StorageError::NotFound(path.to_owned())),
        }
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let normalized = normalize(path)?;
        if normalized.is_empty() {
            return Err(StorageError::InvalidPath(path.to_owned()));
        }
        let mut nodes = self.nodes.write().map_err(|_| Self::poisoned())?;
        Self::require_dir(&nodes, parent_of(&normalized), path)?;
        if matches!(nodes.get(&normalized), Some(Node::Dir)) {
            return Err(StorageError::InvalidPath(format!("{path} is a directory")));
        }
        nodes.insert(normalized, Node::File(data.to_vec()));
        Ok(())
    }

    async fn mkpath(&self, path: &str) -> Result<(), StorageError> {
        let parts = components(path)?;
        let mut nodes = self.nodes.write().map_err(|_| Self::poisoned())?;
        let mut current = String::new();
        for part in parts {
            current = join(&current, part);
            match nodes.get(&current) {
                Some(Node::Dir) => {}
                Some(Node::File(_)) => return Err(StorageError::NotADirectory(current)),
                None => {
                    nodes.insert(current.clone(), Node::Dir);
                }
            }
        }
        Ok(())
    }

    async fn rm(&self, path: &str) -> Result<(), StorageError> {
        let normalized = normalize(path)?;
        if normalized.is_empty() {
            return Err(StorageError::InvalidPath(path.to_owned()));
        }
        let mut nodes = self.nodes.write().map_err(|_| Self::poisoned())?;
        match nodes.get(&normalized) {
            None => return Err(StorageError::NotFound(path.to_owned())),
            Some(Node::Dir) if Self::children(&nodes, &normalized).next().is_some() => {
                return Err(StorageError::NotEmpty(path.to_owned()));
            }
            Some(_) => {}
        }
        nodes.remove(&normalized);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_normalize_separators() {
        assert_eq!(
            components("/data//default/").unwrap(),
            vec!["data", "default"]
        );
        assert!(components("").unwrap().is_empty());
        assert!(components("data/../etc").is_err());
        assert!(components("./data").is_err());
    }

    #[test]
    fn join_handles_root() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a/b/", "c"), "a/b/c");
    }

    #[tokio::test]
    async fn memory_write_requires_parent() {
        let storage = MemoryStorage::new();
        let err = storage.write("vault/data/x", b"1").await.unwrap_err();
        assert!(err.is_not_found());

        storage.mkpath("vault/data").await.unwrap();
        storage.write("vault/data/x", b"1").await.unwrap();
        assert_eq!(storage.read("/vault/data/x").await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn memory_list_is_shallow_and_sorted() {
        let storage = MemoryStorage::new();
        storage.mkpath("v/sub/deep").await.unwrap();
        storage.write("v/b.txt", b"bb").await.unwrap();
        storage.write("v/a.txt", b"a").await.unwrap();
        storage.write("v/sub/c.txt", b"c").await.unwrap();

        let names: Vec<_> = storage
            .list("v")
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir, e.size))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a.txt".to_owned(), false, Some(1)),
                ("b.txt".to_owned(), false, Some(2)),
                ("sub".to_owned(), true, None),
            ]
        );
    }

    #[tokio::test]
    async fn memory_rm_refuses_non_empty_dir() {
        let storage = MemoryStorage::new();
        storage.mkpath("v").await.unwrap();
        storage.write("v/f", b"").await.unwrap();
        assert!(matches!(
            storage.rm("v").await,
            Err(StorageError::NotEmpty(_))
        ));
        storage.rm("v/f").await.unwrap();
        storage.rm("v").await.unwrap();
        assert!(storage.stat("v").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn memory_mkpath_through_file_fails() {
        let storage = MemoryStorage::new();
        storage.write("f", b"x").await.unwrap();
        assert!(matches!(
            storage.mkpath("f/sub").await,
            Err(StorageError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn copy_and_remove_recursive() {
        let storage = MemoryStorage::new();
        storage.mkpath("src/data/default").await.unwrap();
        storage.write("src/data/default/contents.js", b"[]").await.unwrap();
        storage.write("src/readme", b"hi").await.unwrap();

        copy_recursive(&storage, "src", "backup").await.unwrap();
        assert_eq!(
            storage.read("backup/data/default/contents.js").await.unwrap(),
            b"[]"
        );
        assert_eq!(storage.read("backup/readme").await.unwrap(), b"hi");

        remove_recursive(&storage, "src").await.unwrap();
        assert!(storage.stat("src").await.unwrap_err().is_not_found());
        assert!(storage.stat("backup/readme").await.is_ok());
    }

    #[tokio::test]
    async fn root_stat_is_directory() {
        let storage = MemoryStorage::new();
        let root = storage.stat("").await.unwrap();
        assert!(root.is_dir);
        assert!(storage.rm("/").await.is_err());
    }
}
