//! Rechunk configuration.
//!
//! A [`RechunkConfig`] selects the arrays of a multiscale image collection to rechunk and how to rechunk them.
//! It is usually loaded from a JSON file:
//!
//! ```json
//! {
//!     "root_path": "/data/20200812-CardiomyocyteDifferentiation14-Cycle1_mip.zarr",
//!     "wells": ["B/03", "B/04"],
//!     "fields": ["0"],
//!     "levels": [0, 1, 2, 3, 4],
//!     "target_chunks": [1, 1, 50, 50],
//!     "dimension_separator": "/",
//!     "overwrite_mode": "staged"
//! }
//! ```
//!
//! If `levels` is omitted, the levels of each image are discovered from its OME-NGFF `multiscales` attributes.

use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zarrs::array::{ChunkKeySeparator, ChunkShape};

use crate::RechunkError;

/// How a rechunked array replaces the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwriteMode {
    /// Write the new chunks over the original array.
    ///
    /// Original chunks whose keys are reused by the new chunk grid are held in memory until the array is rewritten.
    /// A failure part way through leaves the array with a mix of old and new chunks.
    Direct,
    /// Write the new array to a sibling `<level>_tmp` node, then delete the original and move the new array into place.
    #[default]
    Staged,
}

impl std::fmt::Display for OverwriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Staged => write!(f, "staged"),
        }
    }
}

/// The chunk key dimension separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimensionSeparator {
    /// `/`
    #[serde(rename = "/")]
    Slash,
    /// `.`
    #[serde(rename = ".")]
    Dot,
}

impl From<DimensionSeparator> for ChunkKeySeparator {
    fn from(separator: DimensionSeparator) -> Self {
        match separator {
            DimensionSeparator::Slash => Self::Slash,
            DimensionSeparator::Dot => Self::Dot,
        }
    }
}

/// Options controlling how a single array is rechunked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RechunkOptions {
    /// The new chunk shape, one extent per array dimension.
    pub target_chunks: ChunkShape,
    /// The new chunk key separator. [`None`] keeps the separator of the array.
    pub dimension_separator: Option<DimensionSeparator>,
    /// How the rechunked array replaces the original.
    pub overwrite_mode: OverwriteMode,
    /// The number of threads used to write chunks. [`None`] uses the global `rayon` pool.
    pub threads: Option<usize>,
    /// Rewrite arrays that already have the target chunk shape and separator.
    pub force: bool,
    /// Open and validate arrays without writing anything.
    pub dry_run: bool,
}

impl RechunkOptions {
    /// Create options for rechunking to `target_chunks` with the default staged overwrite mode.
    #[must_use]
    pub fn new(target_chunks: ChunkShape) -> Self {
        Self {
            target_chunks,
            dimension_separator: None,
            overwrite_mode: OverwriteMode::default(),
            threads: None,
            force: false,
            dry_run: false,
        }
    }
}

fn default_fields() -> Vec<String> {
    vec!["0".to_string()]
}

/// The configuration of a batch rechunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RechunkConfig {
    /// The root of the Zarr hierarchy on the filesystem.
    pub root_path: PathBuf,
    /// The wells to process, e.g. `B/03`.
    pub wells: Vec<String>,
    /// The fields (images) of each well to process.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
    /// The pyramid levels to process. [`None`] discovers them from the multiscales metadata of each image.
    #[serde(default)]
    pub levels: Option<Vec<u32>>,
    /// The new chunk shape.
    pub target_chunks: Vec<NonZeroU64>,
    /// The new chunk key separator. [`None`] keeps the separator of each array.
    #[serde(default)]
    pub dimension_separator: Option<DimensionSeparator>,
    /// How a rechunked array replaces the original.
    #[serde(default)]
    pub overwrite_mode: OverwriteMode,
    /// The number of threads used to write chunks.
    #[serde(default)]
    pub threads: Option<usize>,
    /// Rewrite arrays that already have the target chunk shape and separator.
    #[serde(default)]
    pub force: bool,
    /// Open and validate arrays without writing anything.
    #[serde(default)]
    pub dry_run: bool,
}

impl RechunkConfig {
    /// Create a configuration with default options.
    #[must_use]
    pub fn new(
        root_path: impl Into<PathBuf>,
        wells: Vec<String>,
        target_chunks: Vec<NonZeroU64>,
    ) -> Self {
        Self {
            root_path: root_path.into(),
            wells,
            fields: default_fields(),
            levels: None,
            target_chunks,
            dimension_separator: None,
            overwrite_mode: OverwriteMode::default(),
            threads: None,
            force: false,
            dry_run: false,
        }
    }

    /// Parse and validate a JSON configuration.
    ///
    /// # Errors
    /// Returns [`RechunkError::InvalidConfig`] if the JSON is malformed or the configuration is invalid.
    pub fn from_json(json: &str) -> Result<Self, RechunkError> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| RechunkError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a JSON configuration file.
    ///
    /// # Errors
    /// Returns [`RechunkError::InvalidConfig`] if the file cannot be read or its contents are invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RechunkError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            RechunkError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    /// Returns [`RechunkError::InvalidConfig`] if
    ///  - there are no wells, fields, or target chunk extents,
    ///  - an explicit level list is empty,
    ///  - a well or field identifier is not a relative path with non-empty segments other than `.` and `..`, or
    ///  - `threads` is zero.
    pub fn validate(&self) -> Result<(), RechunkError> {
        if self.wells.is_empty() {
            return Err(RechunkError::InvalidConfig("no wells".to_string()));
        }
        if self.fields.is_empty() {
            return Err(RechunkError::InvalidConfig("no fields".to_string()));
        }
        if self.levels.as_ref().is_some_and(Vec::is_empty) {
            return Err(RechunkError::InvalidConfig(
                "levels is empty, omit it to discover levels".to_string(),
            ));
        }
        if self.target_chunks.is_empty() {
            return Err(RechunkError::InvalidConfig(
                "target_chunks is empty".to_string(),
            ));
        }
        if self.threads == Some(0) {
            return Err(RechunkError::InvalidConfig(
                "threads must be positive".to_string(),
            ));
        }
        for identifier in self.wells.iter().chain(&self.fields) {
            if !is_relative_node_path(identifier) {
                return Err(RechunkError::InvalidConfig(format!(
                    "invalid well or field identifier {identifier:?}"
                )));
            }
        }
        Ok(())
    }

    /// The per-array rechunk options.
    #[must_use]
    pub fn options(&self) -> RechunkOptions {
        RechunkOptions {
            target_chunks: self.target_chunks.clone(),
            dimension_separator: self.dimension_separator,
            overwrite_mode: self.overwrite_mode,
            threads: self.threads,
            force: self.force,
            dry_run: self.dry_run,
        }
    }
}

fn is_relative_node_path(identifier: &str) -> bool {
    identifier
        .split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}
