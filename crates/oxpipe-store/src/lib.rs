//! File-system backed storage for oxpipe.
//!
//! A *package* is a directory under the package root holding an optional
//! original file, an `info.properties` file and whatever the pipeline steps
//! produce. This crate owns:
//!
//! - [`PackageStore`] / [`PackageData`]: creating, reopening and describing packages
//! - [`PropertyStore`]: the flat `key=value` file behind package metadata
//! - [`find_files`]: glob resolution relative to a base directory
//! - [`CleanupService`]: the background reclaimer for stale packages
//! - [`XmlElement`]: the owned element tree every XML rendering goes through

pub mod cleanup;
pub mod error;
pub mod glob;
pub mod package;
pub mod properties;
pub mod xml;

pub use cleanup::{
    ActivePackages, CleanupReport, CleanupService, CleanupSettings, CleanupStatus, NoActivePackages,
};
pub use error::{Result, StoreError};
pub use glob::{GlobPattern, find_files, is_glob_pattern, normalize_pattern};
pub use package::{
    ORIGINAL_PROPERTY, PARAMETER_PREFIX, PROPERTIES_FILENAME, PackageData, PackageStore,
};
pub use properties::PropertyStore;
pub use xml::XmlElement;

/// Render a path with forward slashes regardless of the host separator.
pub fn slash_path(path: &std::path::Path) -> String {
    let text = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
