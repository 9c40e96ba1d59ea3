//! Rechunk the arrays of multiscale Zarr image pyramids in place.
//!
//! `zarrs_rechunk` opens each selected array of an image pyramid (`<root>/<well>/<field>/<level>`), re-partitions it into a new regular chunk shape, and replaces the original array with the result.
//! Zarr V2 and V3 arrays are supported through [`zarrs`]. The shape, data type, fill value, codecs, attributes, and Zarr version of each array are preserved.
//!
//! Two overwrite modes are available:
//!  - [`OverwriteMode::Staged`] (default): the new array is written to a sibling `<level>_tmp` node which replaces the original only after every chunk has been written.
//!    A failure leaves the original array intact.
//!  - [`OverwriteMode::Direct`]: the new chunks are written over the original array.
//!    A failure leaves the array with a mix of old and new chunks.
//!
//! ## Example
//! ```no_run
//! # use zarrs_rechunk::{RechunkConfig, run_batch};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RechunkConfig::from_file("rechunk.json")?;
//! let report = run_batch(&config)?;
//! for array in &report.arrays {
//!     println!("{}: {:?} -> {:?}", array.path, array.chunks_before, array.chunks_after);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! A single array can be rechunked with a [`RechunkPlan`]:
//! ```no_run
//! # use std::num::NonZeroU64;
//! # use zarrs::node::NodePath;
//! # use zarrs_rechunk::{PyramidStore, RechunkOptions, RechunkPlan};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PyramidStore::open_filesystem("plate.zarr")?;
//! let chunks = [1, 1, 50, 50].map(|extent| NonZeroU64::new(extent).unwrap()).to_vec();
//! let plan = RechunkPlan::new(&store, &NodePath::new("/B/03/0/0")?, RechunkOptions::new(chunks))?;
//! plan.execute()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//! Progress is reported through the [`log`] crate at the `info` level.
//!
//! ## Licence
//! `zarrs_rechunk` is licensed under either of
//!  - the Apache License, Version 2.0 [LICENSE-APACHE](https://www.apache.org/licenses/LICENSE-2.0) or
//!  - the MIT license [LICENSE-MIT](https://opensource.org/licenses/MIT), at your option.
//!
//! Unless you explicitly state otherwise, any contribution intentionally submitted for inclusion in the work by you, as defined in the Apache-2.0 license, shall be dual licensed as above, without any additional terms or conditions.

mod batch;
mod config;
mod error;
mod multiscales;
mod plan;
mod store;

pub use batch::{ArrayTarget, BatchReport, run_batch, run_batch_with_store, targets};
pub use config::{DimensionSeparator, OverwriteMode, RechunkConfig, RechunkOptions};
pub use error::RechunkError;
pub use multiscales::{discover_levels, group_attributes};
pub use plan::{RechunkPlan, RechunkReport, RechunkStatus, STAGED_SUFFIX};
pub use store::{PyramidStore, SnapshotStorage};
