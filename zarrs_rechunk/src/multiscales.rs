//! Pyramid level discovery from OME-NGFF `multiscales` attributes.
//!
//! An image group lists the arrays of its pyramid in `multiscales[0].datasets[*].path`.
//! OME-NGFF 0.4 places `multiscales` at the top level of the group attributes, 0.5 nests it under `ome`.

use serde::Deserialize;
use serde_json::{Map, Value};
use zarrs::node::NodePath;
use zarrs::storage::{ReadableStorageTraits, StoreKey};

use crate::RechunkError;
use crate::store::{PyramidStore, node_prefix};

#[derive(Deserialize)]
struct Multiscale {
    datasets: Vec<Dataset>,
}

#[derive(Deserialize)]
struct Dataset {
    path: String,
}

/// Read the attributes of the group at `node`.
///
/// Zarr V3 attributes are read from `zarr.json`, Zarr V2 attributes from `.zattrs`.
///
/// # Errors
/// Returns [`RechunkError::NotFound`] if there is no group metadata at `node`,
/// [`RechunkError::Schema`] if the metadata is not valid JSON, or [`RechunkError::Io`] on a storage error.
pub fn group_attributes(
    store: &PyramidStore,
    node: &NodePath,
) -> Result<Map<String, Value>, RechunkError> {
    let storage = store.storage();
    let prefix = node_prefix(node)?;
    let key = |name: &str| {
        StoreKey::new(format!("{}{name}", prefix.as_str()))
            .map_err(|err| RechunkError::Schema(err.to_string()))
    };

    if let Some(bytes) = storage.get(&key("zarr.json")?)? {
        let mut metadata: Map<String, Value> = parse_json(node, "zarr.json", &bytes)?;
        return match metadata.remove("attributes") {
            Some(Value::Object(attributes)) => Ok(attributes),
            Some(_) => Err(RechunkError::Schema(format!(
                "{}: attributes is not an object",
                node.as_str()
            ))),
            None => Ok(Map::new()),
        };
    }

    let attributes = storage.get(&key(".zattrs")?)?;
    let group = storage.get(&key(".zgroup")?)?;
    match (attributes, group) {
        (Some(bytes), _) => parse_json(node, ".zattrs", &bytes),
        (None, Some(_)) => Ok(Map::new()),
        (None, None) => Err(RechunkError::NotFound(node.as_str().to_string())),
    }
}

fn parse_json(
    node: &NodePath,
    name: &str,
    bytes: &[u8],
) -> Result<Map<String, Value>, RechunkError> {
    serde_json::from_slice(bytes)
        .map_err(|err| RechunkError::Schema(format!("{}/{name}: {err}", node.as_str())))
}

/// Discover the pyramid levels of the image group at `node`.
///
/// Returns the dataset paths of the first multiscale in declaration order.
///
/// # Errors
/// Returns [`RechunkError::NotFound`] if there is no group at `node`, or
/// [`RechunkError::Schema`] if the group has no `multiscales` attribute or it is malformed.
pub fn discover_levels(store: &PyramidStore, node: &NodePath) -> Result<Vec<String>, RechunkError> {
    let attributes = group_attributes(store, node)?;
    levels_from_attributes(&attributes)
        .map_err(|reason| RechunkError::Schema(format!("{}: {reason}", node.as_str())))
}

fn levels_from_attributes(attributes: &Map<String, Value>) -> Result<Vec<String>, String> {
    let multiscales = attributes
        .get("ome")
        .and_then(|ome| ome.get("multiscales"))
        .or_else(|| attributes.get("multiscales"))
        .ok_or_else(|| "no multiscales attribute".to_string())?;
    let multiscales: Vec<Multiscale> =
        serde_json::from_value(multiscales.clone()).map_err(|err| format!("multiscales: {err}"))?;
    let Some(multiscale) = multiscales.into_iter().next() else {
        return Err("multiscales is empty".to_string());
    };
    if multiscale.datasets.is_empty() {
        return Err("multiscales[0] has no datasets".to_string());
    }
    multiscale
        .datasets
        .into_iter()
        .map(|dataset| {
            if dataset
                .path
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
            {
                Err(format!("invalid dataset path {:?}", dataset.path))
            } else {
                Ok(dataset.path)
            }
        })
        .collect()
}
