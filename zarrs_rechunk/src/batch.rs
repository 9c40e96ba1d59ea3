//! Rechunking every selected array of a multiscale image collection.

use zarrs::node::NodePath;

use crate::RechunkError;
use crate::config::RechunkConfig;
use crate::multiscales::discover_levels;
use crate::plan::{RechunkPlan, RechunkReport, RechunkStatus};
use crate::store::PyramidStore;

/// An array of an image pyramid, addressed by well, field, and level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayTarget {
    /// The well, e.g. `B/03`.
    pub well: String,
    /// The field (image) of the well, e.g. `0`.
    pub field: String,
    /// The pyramid level, e.g. `0`.
    pub level: String,
}

impl ArrayTarget {
    /// Create a new array target.
    #[must_use]
    pub fn new(well: impl Into<String>, field: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            well: well.into(),
            field: field.into(),
            level: level.into(),
        }
    }

    /// The node path of the array, `/<well>/<field>/<level>`.
    ///
    /// # Errors
    /// Returns [`RechunkError::InvalidConfig`] if the identifiers do not form a valid node path.
    pub fn node_path(&self) -> Result<NodePath, RechunkError> {
        node_path(&[self.well.as_str(), self.field.as_str(), self.level.as_str()])
    }
}

impl std::fmt::Display for ArrayTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}/{}/{}", self.well, self.field, self.level)
    }
}

fn node_path(segments: &[&str]) -> Result<NodePath, RechunkError> {
    let path = format!("/{}", segments.join("/"));
    NodePath::new(&path).map_err(|err| RechunkError::InvalidConfig(err.to_string()))
}

/// The summary of a batch rechunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// The report of each array, in processing order.
    pub arrays: Vec<RechunkReport>,
}

impl BatchReport {
    /// The number of arrays with `status`.
    #[must_use]
    pub fn count(&self, status: RechunkStatus) -> usize {
        self.arrays
            .iter()
            .filter(|report| report.status == status)
            .count()
    }
}

/// Enumerate the arrays selected by `config` in processing order: by well, then field, then level.
///
/// If `config` does not list levels, the levels of each image are discovered from its `multiscales` attributes.
///
/// # Errors
/// Returns a [`RechunkError`] if an identifier is invalid or level discovery fails.
pub fn targets(
    store: &PyramidStore,
    config: &RechunkConfig,
) -> Result<Vec<ArrayTarget>, RechunkError> {
    let mut targets = Vec::new();
    for well in &config.wells {
        for field in &config.fields {
            let levels = match &config.levels {
                Some(levels) => levels.iter().map(ToString::to_string).collect(),
                None => discover_levels(store, &node_path(&[well.as_str(), field.as_str()])?)?,
            };
            targets.extend(
                levels
                    .into_iter()
                    .map(|level| ArrayTarget::new(well.clone(), field.clone(), level)),
            );
        }
    }
    Ok(targets)
}

/// Rechunk every array selected by `config` in the filesystem store at `config.root_path`.
///
/// # Errors
/// Returns the first [`RechunkError`] encountered. Arrays after the failing array are not processed.
pub fn run_batch(config: &RechunkConfig) -> Result<BatchReport, RechunkError> {
    let store = PyramidStore::open_filesystem(&config.root_path)?;
    run_batch_with_store(&store, config)
}

/// Rechunk every array selected by `config` in `store`.
///
/// Arrays are processed one at a time in the order returned by [`targets`].
///
/// # Errors
/// Returns the first [`RechunkError`] encountered. Arrays after the failing array are not processed.
pub fn run_batch_with_store(
    store: &PyramidStore,
    config: &RechunkConfig,
) -> Result<BatchReport, RechunkError> {
    config.validate()?;
    let targets = targets(store, config)?;
    log::info!(
        "rechunking {} arrays to {:?} ({} overwrite)",
        targets.len(),
        config.target_chunks,
        config.overwrite_mode
    );

    let options = config.options();
    let mut report = BatchReport::default();
    for (index, target) in targets.iter().enumerate() {
        log::info!("[{}/{}] {target}", index + 1, targets.len());
        let plan = RechunkPlan::new(store, &target.node_path()?, options.clone())?;
        report.arrays.push(plan.execute()?);
    }

    log::info!(
        "done: {} rechunked, {} unchanged, {} planned",
        report.count(RechunkStatus::Rechunked),
        report.count(RechunkStatus::Unchanged),
        report.count(RechunkStatus::Planned)
    );
    Ok(report)
}
