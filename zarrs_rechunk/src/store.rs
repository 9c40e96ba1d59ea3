//! The store hosting a pyramid.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use zarrs::filesystem::FilesystemStore;
use zarrs::node::NodePath;
use zarrs::storage::byte_range::ByteRangeIterator;
use zarrs::storage::store::MemoryStore;
use zarrs::storage::{
    ListableStorageTraits, MaybeBytes, MaybeBytesIterator, ReadableStorageTraits,
    ReadableWritableListableStorage, StorageError, StoreKey, StoreKeys, StorePrefix,
    WritableStorageTraits,
};

use crate::RechunkError;

/// A store hosting one or more image pyramids.
///
/// Wraps a [`ReadableWritableListableStorage`] and knows how to replace one node with another.
/// If the store is backed by a filesystem directory, nodes are swapped by renaming directories.
/// Otherwise, node keys are copied and the source node erased.
#[derive(Clone)]
pub struct PyramidStore {
    storage: ReadableWritableListableStorage,
    filesystem_root: Option<PathBuf>,
}

impl std::fmt::Debug for PyramidStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidStore")
            .field("filesystem_root", &self.filesystem_root)
            .finish_non_exhaustive()
    }
}

impl PyramidStore {
    /// Create a pyramid store from any readable, writable, and listable storage.
    #[must_use]
    pub fn new(storage: ReadableWritableListableStorage) -> Self {
        Self {
            storage,
            filesystem_root: None,
        }
    }

    /// Open the pyramid store in the filesystem directory `root`.
    ///
    /// # Errors
    /// Returns [`RechunkError::NotFound`] if `root` is not a directory, or [`RechunkError::Io`] if the store cannot be created.
    pub fn open_filesystem(root: impl AsRef<Path>) -> Result<Self, RechunkError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(RechunkError::NotFound(root.display().to_string()));
        }
        let store = FilesystemStore::new(root)
            .map_err(|err| StorageError::Other(format!("{}: {err}", root.display())))?;
        Ok(Self::new(Arc::new(store)).with_filesystem_root(root))
    }

    /// Swap nodes by renaming directories below `root`.
    ///
    /// `root` must be the directory backing the storage.
    #[must_use]
    pub fn with_filesystem_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.filesystem_root = Some(root.into());
        self
    }

    /// The underlying storage.
    #[must_use]
    pub fn storage(&self) -> &ReadableWritableListableStorage {
        &self.storage
    }

    /// The filesystem directory backing the store, if any.
    #[must_use]
    pub fn filesystem_root(&self) -> Option<&Path> {
        self.filesystem_root.as_deref()
    }

    /// List every key below `node`.
    ///
    /// # Errors
    /// Returns [`RechunkError::Io`] if the store cannot be listed.
    pub fn node_keys(&self, node: &NodePath) -> Result<StoreKeys, RechunkError> {
        Ok(self.storage.list_prefix(&node_prefix(node)?)?)
    }

    /// Erase `node` and everything below it. Erasing a node that does not exist is not an error.
    ///
    /// # Errors
    /// Returns [`RechunkError::Io`] if the store fails to erase the node.
    pub fn erase_node(&self, node: &NodePath) -> Result<(), RechunkError> {
        Ok(self.storage.erase_prefix(&node_prefix(node)?)?)
    }

    /// Take a snapshot of the `shadowed` keys.
    ///
    /// Only the `shadowed` keys that currently exist are copied into memory.
    /// The returned storage reads `shadowed` keys from the copy and every other key from the store, so `shadowed` keys can be overwritten while their original values are still being read.
    ///
    /// # Errors
    /// Returns [`RechunkError::Io`] if a key cannot be read.
    pub fn snapshot(&self, shadowed: BTreeSet<StoreKey>) -> Result<SnapshotStorage, RechunkError> {
        let snapshot = MemoryStore::new();
        for key in &shadowed {
            if let Some(value) = self.storage.get(key)? {
                snapshot.set(key, value)?;
            }
        }
        Ok(SnapshotStorage {
            storage: self.storage.clone(),
            snapshot,
            shadowed,
        })
    }

    /// Replace `target` with `staged`.
    ///
    /// Everything below `target` is deleted and the tree at `staged` moved into its place.
    /// After the swap, `staged` no longer exists.
    ///
    /// # Errors
    /// Returns [`RechunkError::Io`] if the deletion or move fails.
    pub fn swap_node(&self, staged: &NodePath, target: &NodePath) -> Result<(), RechunkError> {
        if let Some(root) = &self.filesystem_root {
            let staged_dir = node_dir(root, staged);
            let target_dir = node_dir(root, target);
            match std::fs::remove_dir_all(&target_dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            std::fs::rename(&staged_dir, &target_dir)?;
        } else {
            let staged_prefix = node_prefix(staged)?;
            let target_prefix = node_prefix(target)?;
            self.storage.erase_prefix(&target_prefix)?;
            for key in self.storage.list_prefix(&staged_prefix)? {
                let Some(value) = self.storage.get(&key)? else {
                    continue;
                };
                let relative = key
                    .as_str()
                    .strip_prefix(staged_prefix.as_str())
                    .unwrap_or(key.as_str());
                let moved = StoreKey::new(format!("{}{relative}", target_prefix.as_str()))
                    .map_err(|err| StorageError::Other(err.to_string()))?;
                self.storage.set(&moved, value)?;
            }
            self.storage.erase_prefix(&staged_prefix)?;
        }
        Ok(())
    }
}

/// A read-only view of a store with some keys frozen at the time of a [`PyramidStore::snapshot`].
pub struct SnapshotStorage {
    storage: ReadableWritableListableStorage,
    snapshot: MemoryStore,
    shadowed: BTreeSet<StoreKey>,
}

impl std::fmt::Debug for SnapshotStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStorage")
            .field("shadowed", &self.shadowed.len())
            .finish_non_exhaustive()
    }
}

impl SnapshotStorage {
    /// The keys held in memory.
    ///
    /// # Errors
    /// Returns [`RechunkError::Io`] if the in-memory copy cannot be listed.
    pub fn snapshot_keys(&self) -> Result<StoreKeys, RechunkError> {
        Ok(self.snapshot.list()?)
    }
}

impl ReadableStorageTraits for SnapshotStorage {
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        if self.shadowed.contains(key) {
            self.snapshot.get(key)
        } else {
            self.storage.get(key)
        }
    }

    fn get_partial_many<'a>(
        &'a self,
        key: &StoreKey,
        byte_ranges: ByteRangeIterator<'a>,
    ) -> Result<MaybeBytesIterator<'a>, StorageError> {
        if self.shadowed.contains(key) {
            self.snapshot.get_partial_many(key, byte_ranges)
        } else {
            self.storage.get_partial_many(key, byte_ranges)
        }
    }

    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        if self.shadowed.contains(key) {
            self.snapshot.size_key(key)
        } else {
            self.storage.size_key(key)
        }
    }

    fn supports_get_partial(&self) -> bool {
        self.storage.supports_get_partial() && self.snapshot.supports_get_partial()
    }
}

/// The store prefix of `node`.
pub(crate) fn node_prefix(node: &NodePath) -> Result<StorePrefix, StorageError> {
    let prefix: StorePrefix = node.try_into()?;
    Ok(prefix)
}

fn node_dir(root: &Path, node: &NodePath) -> PathBuf {
    let relative = node.as_str().trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}
