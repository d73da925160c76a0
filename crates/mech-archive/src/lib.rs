//! Archive Gateway (spec §4.3): maps Pool/Task groups and datasets into the
//! backend container, commits attributes, and validates archive identity on
//! restart. `ArchiveBackend` is the small interface the core consumes;
//! `Hdf5Backend` is the production implementation.

use std::path::Path;

use mech_types::{AttrValue, MechError, Schema};

pub mod hdf5_backend;
pub mod layout;

pub use hdf5_backend::{ArchiveGuard, Hdf5Backend};

/// The archive backend interface the core consumes (spec §1 "the core
/// consumes a small interface"), grounded on `core-terminal`'s
/// `TerminalBackend` trait shape.
pub trait ArchiveBackend: Sized {
    fn create(path: &Path) -> Result<Self, MechError>;
    fn open(path: &Path) -> Result<Self, MechError>;
    fn create_group(&self, path: &str) -> Result<(), MechError>;
    fn create_dataset(&self, group: &str, schema: &Schema) -> Result<(), MechError>;
    fn write_hyperslab(
        &self,
        dataset: &str,
        offsets: &[usize],
        dims: &[usize],
        bytes: &[u8],
    ) -> Result<(), MechError>;
    fn read_hyperslab(
        &self,
        dataset: &str,
        offsets: &[usize],
        dims: &[usize],
        buf: &mut [u8],
    ) -> Result<(), MechError>;
    fn write_attribute(&self, target: &str, name: &str, value: &AttrValue) -> Result<(), MechError>;
    fn read_attribute(&self, target: &str, name: &str) -> Result<AttrValue, MechError>;
    fn hard_link(&self, src: &str, dst: &str) -> Result<(), MechError>;
    /// Unlinks a dataset (spec §9 Open Question #1: `TEMP` datasets are
    /// removed once the pool that wrote them finishes processing).
    fn delete_dataset(&self, path: &str) -> Result<(), MechError>;
}

/// Checks `@MODULE` equality and `@API` >= the running version (spec
/// §4.3 `Validate`), failing `RestartIncompatible` (modeled as
/// [`MechError::Restart`]) otherwise.
pub fn validate<B: ArchiveBackend>(
    backend: &B,
    running_module: &str,
    running_api_version: f64,
) -> Result<(), MechError> {
    let module = backend.read_attribute("/", layout::ATTR_MODULE)?;
    let api = backend.read_attribute("/", layout::ATTR_API)?;

    let module_matches = matches!(&module, AttrValue::Text(m) if m == running_module);
    if !module_matches {
        return Err(MechError::Restart(format!(
            "archive module identity {module:?} does not match running module '{running_module}'"
        )));
    }

    let archived_api = match api {
        AttrValue::Double(v) => v,
        AttrValue::Int(v) => v as f64,
        other => {
            return Err(MechError::Restart(format!(
                "archive @API attribute has unexpected type: {other:?}"
            )))
        }
    };
    if archived_api < running_api_version {
        return Err(MechError::Restart(format!(
            "archive @API {archived_api} is older than running version {running_api_version}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    // `Hdf5Backend` needs a real filesystem + libhdf5; exercised by the
    // integration suite in `mech-bin/tests` (scenario S2/S3/S7) rather than
    // here, matching `core-terminal`'s split of logic-only unit tests from
    // environment-dependent integration coverage.
}
