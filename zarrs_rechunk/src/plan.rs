//! Rechunking a single array.
//!
//! A [`RechunkPlan`] opens an array and derives its re-partitioned metadata without touching any chunk data.
//! [`RechunkPlan::execute`] then materializes the new chunks and replaces the original array.

use std::collections::BTreeSet;
use std::num::NonZeroU64;
use std::sync::Arc;

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde_json::{Value, json};
use zarrs::array::CodecOptions;
use zarrs::array::{
    Array, ArrayBytes, ArrayMetadata, ArrayMetadataOptions, ArraySubset, ChunkKeySeparator,
    ChunkShape,
};
use zarrs::metadata::v3::MetadataV3;
use zarrs::node::NodePath;
use zarrs::storage::store::MemoryStore;
use zarrs::storage::{
    ReadableStorageTraits, ReadableWritableListableStorageTraits, StoreKey, WritableStorageTraits,
};

use crate::RechunkError;
use crate::config::{OverwriteMode, RechunkOptions};
use crate::store::PyramidStore;

type StoreArray = Array<dyn ReadableWritableListableStorageTraits>;

/// Metadata file names that may sit alongside the chunks of an array.
const METADATA_FILE_NAMES: [&str; 5] = ["zarr.json", ".zarray", ".zattrs", ".zgroup", ".zmetadata"];

/// The suffix of the sibling node an array is staged to.
pub const STAGED_SUFFIX: &str = "_tmp";

/// The outcome of rechunking an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RechunkStatus {
    /// The array was rewritten with the new chunk shape.
    Rechunked,
    /// The array already had the target chunk shape and separator and was left untouched.
    Unchanged,
    /// The rechunk was validated but nothing was written (dry run).
    Planned,
}

impl std::fmt::Display for RechunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rechunked => write!(f, "rechunked"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Planned => write!(f, "planned"),
        }
    }
}

/// A summary of rechunking an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RechunkReport {
    /// The node path of the array.
    pub path: String,
    /// The array shape.
    pub shape: Vec<u64>,
    /// The data type name.
    pub data_type: String,
    /// The chunk shape before the rechunk. [`None`] if the array did not have a regular chunk grid.
    pub chunks_before: Option<Vec<u64>>,
    /// The chunk shape after the rechunk.
    pub chunks_after: Vec<u64>,
    /// How the original array was replaced.
    pub mode: OverwriteMode,
    /// The outcome.
    pub status: RechunkStatus,
    /// The number of chunks of the new chunk grid that were materialized.
    pub chunks_written: u64,
    /// The number of orphaned keys erased after a direct overwrite.
    pub keys_pruned: u64,
}

/// A planned rechunk of one array.
///
/// Creating a plan opens the source array and validates the new chunk shape, but does not write anything.
pub struct RechunkPlan {
    store: PyramidStore,
    path: NodePath,
    staged_path: NodePath,
    source: StoreArray,
    target_metadata: ArrayMetadata,
    options: RechunkOptions,
    chunks_before: Option<Vec<u64>>,
    unchanged: bool,
}

impl std::fmt::Debug for RechunkPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RechunkPlan")
            .field("path", &self.path)
            .field("staged_path", &self.staged_path)
            .field("options", &self.options)
            .field("chunks_before", &self.chunks_before)
            .field("unchanged", &self.unchanged)
            .finish_non_exhaustive()
    }
}

impl RechunkPlan {
    /// Plan a rechunk of the array at `path` in `store`.
    ///
    /// # Errors
    /// Returns
    ///  - [`RechunkError::NotFound`] if there is no array at `path`,
    ///  - [`RechunkError::Schema`] if its metadata is invalid or cannot be re-partitioned, including codecs that reject the new chunk shape,
    ///  - [`RechunkError::ShapeMismatch`] if the target chunk shape does not match the array dimensionality, or
    ///  - [`RechunkError::Io`] on a storage error.
    pub fn new(
        store: &PyramidStore,
        path: &NodePath,
        options: RechunkOptions,
    ) -> Result<Self, RechunkError> {
        let source = Array::open(store.storage().clone(), path.as_str())
            .map_err(|err| RechunkError::from_array_create(path.as_str(), err))?;
        if options.target_chunks.len() != source.dimensionality() {
            return Err(RechunkError::ShapeMismatch {
                array: source.dimensionality(),
                chunks: options.target_chunks.len(),
            });
        }

        let staged_path = NodePath::new(&format!("{}{STAGED_SUFFIX}", path.as_str()))
            .map_err(|err| RechunkError::Schema(err.to_string()))?;
        let chunks_before = chunk_shape(source.metadata());
        let separator_before = chunk_key_separator(source.metadata());
        let separator = options.dimension_separator.map(ChunkKeySeparator::from);
        let target_metadata = repartition(source.metadata(), &options.target_chunks, separator)?;

        // Validates the new metadata and the codecs against the new chunk shape
        let scratch = Array::new_with_metadata(
            Arc::new(MemoryStore::new()),
            path.as_str(),
            target_metadata.clone(),
        )
        .map_err(|err| RechunkError::Schema(format!("{}: {err}", path.as_str())))?;
        encode_fill_value_chunk(&scratch)
            .map_err(|reason| RechunkError::Schema(format!("{}: {reason}", path.as_str())))?;

        let target_chunks = chunk_extents(&options.target_chunks);
        let unchanged = chunks_before.as_deref() == Some(target_chunks.as_slice())
            && separator.is_none_or(|separator| separator_before == Some(separator));

        Ok(Self {
            store: store.clone(),
            path: path.clone(),
            staged_path,
            source,
            target_metadata,
            options,
            chunks_before,
            unchanged,
        })
    }

    /// The node path of the array.
    #[must_use]
    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// The node path the new array is staged to in [`OverwriteMode::Staged`].
    #[must_use]
    pub fn staged_path(&self) -> &NodePath {
        &self.staged_path
    }

    /// Returns true if the array already has the target chunk shape and separator.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.unchanged
    }

    /// The re-partitioned array metadata.
    #[must_use]
    pub fn target_metadata(&self) -> &ArrayMetadata {
        &self.target_metadata
    }

    /// Materialize the rechunked array and replace the original.
    ///
    /// Blocks until every chunk is written or a write fails.
    ///
    /// # Errors
    /// Returns a [`RechunkError`] if a chunk cannot be read, encoded, or written, or the original array cannot be replaced.
    /// In [`OverwriteMode::Staged`] the original array is intact after any error.
    pub fn execute(&self) -> Result<RechunkReport, RechunkError> {
        let mut report = RechunkReport {
            path: self.path.as_str().to_string(),
            shape: self.source.shape().to_vec(),
            data_type: data_type_name(self.source.metadata()),
            chunks_before: self.chunks_before.clone(),
            chunks_after: chunk_extents(&self.options.target_chunks),
            mode: self.options.overwrite_mode,
            status: RechunkStatus::Planned,
            chunks_written: 0,
            keys_pruned: 0,
        };
        log::info!(
            "{}: shape {:?}, data type {}, chunks {} -> {:?} ({})",
            report.path,
            report.shape,
            report.data_type,
            report
                .chunks_before
                .as_ref()
                .map_or_else(|| "irregular".to_string(), |chunks| format!("{chunks:?}")),
            report.chunks_after,
            report.mode,
        );

        if self.unchanged && !self.options.force {
            report.status = RechunkStatus::Unchanged;
            log::info!("{}: already has the target chunk shape, skipping", report.path);
            return Ok(report);
        }
        if self.options.dry_run {
            log::info!("{}: dry run, nothing written", report.path);
            return Ok(report);
        }

        match self.options.overwrite_mode {
            OverwriteMode::Direct => {
                (report.chunks_written, report.keys_pruned) = self.overwrite_direct()?;
            }
            OverwriteMode::Staged => {
                report.chunks_written = self.overwrite_staged()?;
            }
        }
        report.status = RechunkStatus::Rechunked;
        log::info!(
            "{}: rechunked, {} chunks written, {} stale keys pruned",
            report.path,
            report.chunks_written,
            report.keys_pruned
        );
        Ok(report)
    }

    fn target_array(&self, path: &NodePath) -> Result<StoreArray, RechunkError> {
        let array = Array::new_with_metadata(
            self.store.storage().clone(),
            path.as_str(),
            self.target_metadata.clone(),
        )
        .map_err(|err| RechunkError::Schema(format!("{}: {err}", path.as_str())))?;
        Ok(array.with_metadata_options(
            ArrayMetadataOptions::default().with_include_zarrs_metadata(false),
        ))
    }

    fn overwrite_direct(&self) -> Result<(u64, u64), RechunkError> {
        let target = self.target_array(&self.path)?;
        // Chunks of the new grid may overwrite chunks of the original grid that are still to be read
        let snapshot = self.store.snapshot(chunk_keys(&target))?;
        log::info!(
            "{}: holding {} overwritten chunks in memory",
            self.path.as_str(),
            snapshot.snapshot_keys()?.len()
        );
        let source = self.source.with_storage(Arc::new(snapshot));

        target.store_metadata()?;
        log::info!("{}: writing chunks in place", self.path.as_str());
        let chunks_written = materialize(&source, &target, self.options.threads)?;

        let keys_pruned = prune_orphans(&self.store, &target)?;
        Ok((chunks_written, keys_pruned))
    }

    fn overwrite_staged(&self) -> Result<u64, RechunkError> {
        self.store.erase_node(&self.staged_path)?;
        let staged = self.target_array(&self.staged_path)?;
        staged.store_metadata()?;
        log::info!("{}: writing chunks", self.staged_path.as_str());
        let chunks_written = materialize(&self.source, &staged, self.options.threads)?;

        log::info!(
            "{}: replacing with {}",
            self.path.as_str(),
            self.staged_path.as_str()
        );
        self.store.swap_node(&self.staged_path, &self.path)?;
        Ok(chunks_written)
    }
}

/// Assemble every chunk of `target` from `source` and store it.
///
/// Returns the number of chunks in the chunk grid of `target`.
fn materialize<TStorage: ?Sized + ReadableStorageTraits + Send + Sync + 'static>(
    source: &Array<TStorage>,
    target: &StoreArray,
    threads: Option<usize>,
) -> Result<u64, RechunkError> {
    let chunks = ArraySubset::new_with_shape(target.chunk_grid_shape().to_vec());
    let store_chunks = || {
        chunks
            .indices()
            .into_par_iter()
            .try_for_each(|chunk_indices| {
                let chunk_subset = target.chunk_subset(&chunk_indices)?;
                let chunk_bytes: ArrayBytes<'static> =
                    source.retrieve_array_subset(&chunk_subset)?;
                target.store_chunk(&chunk_indices, chunk_bytes)?;
                Ok::<_, RechunkError>(())
            })
    };
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()?
            .install(store_chunks)?;
    } else {
        store_chunks()?;
    }
    Ok(chunks.num_elements())
}

/// Encode a chunk of fill values through the codecs of `array`, without storing it.
fn encode_fill_value_chunk(array: &Array<MemoryStore>) -> Result<(), String> {
    let chunk_indices = vec![0; array.dimensionality()];
    let chunk_shape = array
        .chunk_shape(&chunk_indices)
        .map_err(|err| err.to_string())?;
    let num_elements = chunk_shape.iter().map(|extent| extent.get()).product();
    let chunk_bytes =
        ArrayBytes::new_fill_value(array.data_type(), num_elements, array.fill_value())
            .map_err(|err| err.to_string())?;
    array
        .store_chunk_opt(
            &chunk_indices,
            chunk_bytes,
            &CodecOptions::default().with_store_empty_chunks(true),
        )
        .map_err(|err| err.to_string())
}

/// The keys of every chunk in the chunk grid of `array`.
fn chunk_keys(array: &StoreArray) -> BTreeSet<StoreKey> {
    ArraySubset::new_with_shape(array.chunk_grid_shape().to_vec())
        .indices()
        .into_iter()
        .map(|chunk_indices| array.chunk_key(&chunk_indices))
        .collect()
}

/// Erase every key of `array` that is neither metadata nor a chunk of its chunk grid.
fn prune_orphans(store: &PyramidStore, array: &StoreArray) -> Result<u64, RechunkError> {
    let chunk_keys = chunk_keys(array);
    let orphans: Vec<StoreKey> = store
        .node_keys(array.path())?
        .into_iter()
        .filter(|key| {
            let name = key.as_str().rsplit('/').next().unwrap_or_default();
            !METADATA_FILE_NAMES.contains(&name) && !chunk_keys.contains(key)
        })
        .collect();
    if !orphans.is_empty() {
        log::info!(
            "{}: erasing {} orphaned keys",
            array.path().as_str(),
            orphans.len()
        );
        store.storage().erase_many(&orphans)?;
    }
    Ok(orphans.len() as u64)
}

fn chunk_extents(chunks: &ChunkShape) -> Vec<u64> {
    chunks.iter().map(|extent| extent.get()).collect()
}

/// The regular chunk shape of an array, if it has one.
fn chunk_shape(metadata: &ArrayMetadata) -> Option<Vec<u64>> {
    match metadata {
        ArrayMetadata::V2(metadata) => Some(chunk_extents(&metadata.chunks)),
        ArrayMetadata::V3(metadata) => {
            if metadata.chunk_grid.name() != "regular" {
                return None;
            }
            let configuration = configuration(&metadata.chunk_grid)?;
            serde_json::from_value::<Vec<NonZeroU64>>(configuration.get("chunk_shape")?.clone())
                .ok()
                .map(|chunks| chunk_extents(&chunks))
        }
    }
}

/// The chunk key separator of an array, if it uses the `v2` or `default` chunk key encoding.
fn chunk_key_separator(metadata: &ArrayMetadata) -> Option<ChunkKeySeparator> {
    match metadata {
        ArrayMetadata::V2(metadata) => Some(metadata.dimension_separator),
        ArrayMetadata::V3(metadata) => {
            let encoding = &metadata.chunk_key_encoding;
            let default = match encoding.name() {
                "default" => ChunkKeySeparator::Slash,
                "v2" => ChunkKeySeparator::Dot,
                _ => return None,
            };
            let separator = configuration(encoding)
                .and_then(|configuration| configuration.get("separator").cloned())
                .and_then(|separator| serde_json::from_value(separator).ok());
            Some(separator.unwrap_or(default))
        }
    }
}

fn configuration(metadata: &MetadataV3) -> Option<serde_json::Map<String, Value>> {
    match serde_json::to_value(metadata).ok()? {
        Value::Object(mut metadata) => match metadata.remove("configuration")? {
            Value::Object(configuration) => Some(configuration),
            _ => None,
        },
        _ => None,
    }
}

/// Derive array metadata with a regular chunk grid of `chunks` and optionally a new chunk key `separator`.
///
/// Everything else (data type, fill value, codecs, attributes, dimension names, and Zarr version) is preserved.
fn repartition(
    metadata: &ArrayMetadata,
    chunks: &ChunkShape,
    separator: Option<ChunkKeySeparator>,
) -> Result<ArrayMetadata, RechunkError> {
    match metadata {
        ArrayMetadata::V2(metadata) => {
            let mut metadata = metadata.clone();
            metadata.chunks = chunks.clone();
            if let Some(separator) = separator {
                metadata.dimension_separator = separator;
            }
            Ok(ArrayMetadata::V2(metadata))
        }
        ArrayMetadata::V3(metadata) => {
            let mut metadata = metadata.clone();
            metadata.chunk_grid = metadata_v3(json!({
                "name": "regular",
                "configuration": { "chunk_shape": chunk_extents(chunks) },
            }))?;
            if let Some(separator) = separator {
                let name = metadata.chunk_key_encoding.name();
                if name != "default" && name != "v2" {
                    return Err(RechunkError::Schema(format!(
                        "cannot change the separator of the {name} chunk key encoding"
                    )));
                }
                metadata.chunk_key_encoding = metadata_v3(json!({
                    "name": name,
                    "configuration": { "separator": separator },
                }))?;
            }
            Ok(ArrayMetadata::V3(metadata))
        }
    }
}

fn metadata_v3(value: Value) -> Result<MetadataV3, RechunkError> {
    serde_json::from_value(value).map_err(|err| RechunkError::Schema(err.to_string()))
}

fn data_type_name(metadata: &ArrayMetadata) -> String {
    match metadata {
        ArrayMetadata::V2(metadata) => match serde_json::to_value(&metadata.dtype) {
            Ok(Value::String(dtype)) => dtype,
            Ok(dtype) => dtype.to_string(),
            Err(_) => "unknown".to_string(),
        },
        ArrayMetadata::V3(metadata) => metadata.data_type.name().to_string(),
    }
}
