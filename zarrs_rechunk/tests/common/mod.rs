#![allow(dead_code)]

use std::num::NonZeroU64;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use walkdir::WalkDir;
use zarrs::array::{Array, ArrayMetadata};
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::byte_range::ByteRangeIterator;
use zarrs::storage::{
    Bytes, ListableStorageTraits, MaybeBytes, MaybeBytesIterator, OffsetBytesIterator,
    ReadableStorageTraits, StorageError, StoreKey, StoreKeys, StoreKeysPrefixes, StorePrefix,
    WritableStorageTraits,
};
use zarrs_rechunk::PyramidStore;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// A storage adapter that fails every write below a prefix once a number of writes below that prefix have succeeded.
#[derive(Debug)]
pub struct FaultyStore<TStorage: ?Sized> {
    storage: Arc<TStorage>,
    prefix: String,
    successful_writes: usize,
    writes: AtomicUsize,
}

impl<TStorage: ?Sized> FaultyStore<TStorage> {
    pub fn new(storage: Arc<TStorage>, prefix: &str, successful_writes: usize) -> Self {
        Self {
            storage,
            prefix: prefix.to_string(),
            successful_writes,
            writes: AtomicUsize::default(),
        }
    }

    fn check_write(&self, key: &StoreKey) -> Result<(), StorageError> {
        if key.as_str().starts_with(&self.prefix)
            && self.writes.fetch_add(1, Ordering::SeqCst) >= self.successful_writes
        {
            Err(StorageError::Other(format!(
                "injected write failure at {}",
                key.as_str()
            )))
        } else {
            Ok(())
        }
    }
}

impl<TStorage: ?Sized + ReadableStorageTraits> ReadableStorageTraits for FaultyStore<TStorage> {
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        self.storage.get(key)
    }

    fn get_partial_many<'a>(
        &'a self,
        key: &StoreKey,
        byte_ranges: ByteRangeIterator<'a>,
    ) -> Result<MaybeBytesIterator<'a>, StorageError> {
        self.storage.get_partial_many(key, byte_ranges)
    }

    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        self.storage.size_key(key)
    }

    fn supports_get_partial(&self) -> bool {
        self.storage.supports_get_partial()
    }
}

impl<TStorage: ?Sized + ListableStorageTraits> ListableStorageTraits for FaultyStore<TStorage> {
    fn list(&self) -> Result<StoreKeys, StorageError> {
        self.storage.list()
    }

    fn list_prefix(&self, prefix: &StorePrefix) -> Result<StoreKeys, StorageError> {
        self.storage.list_prefix(prefix)
    }

    fn list_dir(&self, prefix: &StorePrefix) -> Result<StoreKeysPrefixes, StorageError> {
        self.storage.list_dir(prefix)
    }

    fn size_prefix(&self, prefix: &StorePrefix) -> Result<u64, StorageError> {
        self.storage.size_prefix(prefix)
    }

    fn size(&self) -> Result<u64, StorageError> {
        self.storage.size()
    }
}

impl<TStorage: ?Sized + WritableStorageTraits> WritableStorageTraits for FaultyStore<TStorage> {
    fn set(&self, key: &StoreKey, value: Bytes) -> Result<(), StorageError> {
        self.check_write(key)?;
        self.storage.set(key, value)
    }

    fn set_partial_many(
        &self,
        key: &StoreKey,
        offset_values: OffsetBytesIterator,
    ) -> Result<(), StorageError> {
        self.check_write(key)?;
        self.storage.set_partial_many(key, offset_values)
    }

    fn erase(&self, key: &StoreKey) -> Result<(), StorageError> {
        self.storage.erase(key)
    }

    fn erase_many(&self, keys: &[StoreKey]) -> Result<(), StorageError> {
        self.storage.erase_many(keys)
    }

    fn erase_prefix(&self, prefix: &StorePrefix) -> Result<(), StorageError> {
        self.storage.erase_prefix(prefix)
    }

    fn supports_set_partial(&self) -> bool {
        self.storage.supports_set_partial()
    }
}

/// A pyramid store in `root` whose writes below `prefix` fail after `successful_writes` writes.
pub fn faulty_store(
    root: &Path,
    prefix: &str,
    successful_writes: usize,
) -> Result<PyramidStore, Box<dyn std::error::Error>> {
    let storage = Arc::new(FilesystemStore::new(root)?);
    let storage = Arc::new(FaultyStore::new(storage, prefix, successful_writes));
    Ok(PyramidStore::new(storage).with_filesystem_root(root))
}

pub fn non_zero(extents: &[u64]) -> Vec<NonZeroU64> {
    extents
        .iter()
        .map(|&extent| NonZeroU64::new(extent).unwrap())
        .collect()
}

/// Deterministic test elements for an array with `num_elements` elements.
pub fn elements(num_elements: u64) -> Vec<u16> {
    (0..num_elements).map(|i| (i % 65_521) as u16).collect()
}

/// Write an uncompressed `uint16` Zarr V2 array with `/` separated chunk keys and fill it with [`elements`].
pub fn write_v2_array(root: &Path, path: &str, shape: &[u64], chunks: &[u64]) -> TestResult {
    let array_dir = root.join(path.trim_start_matches('/'));
    std::fs::create_dir_all(&array_dir)?;
    let metadata = json!({
        "zarr_format": 2,
        "shape": shape,
        "chunks": chunks,
        "dtype": "<u2",
        "compressor": null,
        "fill_value": 0,
        "order": "C",
        "filters": null,
        "dimension_separator": "/"
    });
    std::fs::write(array_dir.join(".zarray"), serde_json::to_vec_pretty(&metadata)?)?;
    fill_array(root, path)
}

/// Write an uncompressed `uint16` Zarr V3 array with the default chunk key encoding and fill it with [`elements`].
pub fn write_v3_array(root: &Path, path: &str, shape: &[u64], chunks: &[u64]) -> TestResult {
    let codecs = json!([{"name": "bytes", "configuration": {"endian": "little"}}]);
    write_v3_array_with_codecs(root, path, shape, chunks, codecs)
}

/// Write a `uint16` Zarr V3 array with shards of `chunks` split into `subchunks`, and fill it with [`elements`].
pub fn write_v3_sharded_array(
    root: &Path,
    path: &str,
    shape: &[u64],
    chunks: &[u64],
    subchunks: &[u64],
) -> TestResult {
    let codecs = json!([{
        "name": "sharding_indexed",
        "configuration": {
            "chunk_shape": subchunks,
            "codecs": [{"name": "bytes", "configuration": {"endian": "little"}}],
            "index_codecs": [
                {"name": "bytes", "configuration": {"endian": "little"}},
                {"name": "crc32c"}
            ],
            "index_location": "end"
        }
    }]);
    write_v3_array_with_codecs(root, path, shape, chunks, codecs)
}

fn write_v3_array_with_codecs(
    root: &Path,
    path: &str,
    shape: &[u64],
    chunks: &[u64],
    codecs: Value,
) -> TestResult {
    let array_dir = root.join(path.trim_start_matches('/'));
    std::fs::create_dir_all(&array_dir)?;
    let metadata = json!({
        "zarr_format": 3,
        "node_type": "array",
        "shape": shape,
        "data_type": "uint16",
        "chunk_grid": {"name": "regular", "configuration": {"chunk_shape": chunks}},
        "chunk_key_encoding": {"name": "default", "configuration": {"separator": "/"}},
        "fill_value": 0,
        "codecs": codecs,
        "attributes": {},
        "dimension_names": ["c", "z", "y", "x"]
    });
    std::fs::write(array_dir.join("zarr.json"), serde_json::to_vec_pretty(&metadata)?)?;
    fill_array(root, path)
}

fn fill_array(root: &Path, path: &str) -> TestResult {
    let store = Arc::new(FilesystemStore::new(root)?);
    let array = Array::open(store, path)?;
    let subset = array.subset_all();
    array.store_array_subset(&subset, elements(subset.num_elements()))?;
    Ok(())
}

/// Write an OME-NGFF 0.4 image group with `levels` datasets.
pub fn write_image_group(root: &Path, path: &str, levels: usize) -> TestResult {
    let group_dir = root.join(path.trim_start_matches('/'));
    std::fs::create_dir_all(&group_dir)?;
    std::fs::write(group_dir.join(".zgroup"), br#"{"zarr_format": 2}"#)?;
    let datasets: Vec<_> = (0..levels)
        .map(|level| json!({"path": level.to_string()}))
        .collect();
    let attributes = json!({
        "multiscales": [{"version": "0.4", "name": "image", "datasets": datasets}]
    });
    std::fs::write(group_dir.join(".zattrs"), serde_json::to_vec_pretty(&attributes)?)?;
    Ok(())
}

/// Write a plate of `wells`, each with field `0` holding a pyramid of `levels` V2 arrays of shape `(1, 2, 160 / 2^level, 160 / 2^level)`.
pub fn write_plate(root: &Path, wells: &[&str], levels: usize) -> TestResult {
    for well in wells {
        let image = format!("/{well}/0");
        write_image_group(root, &image, levels)?;
        for level in 0..levels {
            let extent = 160 >> level;
            write_v2_array(
                root,
                &format!("{image}/{level}"),
                &[1, 2, extent, extent],
                &[1, 1, extent, extent],
            )?;
        }
    }
    Ok(())
}

/// The regular chunk shape of the array at `path`.
pub fn chunk_shape(root: &Path, path: &str) -> Result<Vec<u64>, Box<dyn std::error::Error>> {
    let store = Arc::new(FilesystemStore::new(root)?);
    let array = Array::open(store, path)?;
    Ok(match array.metadata() {
        ArrayMetadata::V2(metadata) => metadata.chunks.iter().map(|c| c.get()).collect(),
        ArrayMetadata::V3(_) => array.chunk_shape(&vec![0; array.dimensionality()])?
            .iter()
            .map(|c| c.get())
            .collect(),
    })
}

/// The shape and elements of the array at `path`.
pub fn read_array(
    root: &Path,
    path: &str,
) -> Result<(Vec<u64>, Vec<u16>), Box<dyn std::error::Error>> {
    let store = Arc::new(FilesystemStore::new(root)?);
    let array = Array::open(store, path)?;
    let elements: Vec<u16> = array.retrieve_array_subset(&array.subset_all())?;
    Ok((array.shape().to_vec(), elements))
}

/// The relative paths of every file below `dir`, sorted.
pub fn files(dir: &Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let mut files: Vec<String> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .ok()
                .map(|relative| relative.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    Ok(files)
}
