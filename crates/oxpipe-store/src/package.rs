//! Packages: one directory per unit of work.
//!
//! A package lives at `<root>/<PACKAGE-ID>/` and holds the original file (if
//! any) under its own name, an `info.properties` file with metadata and
//! parameters, and whatever the pipeline steps write. Properties are only
//! written when [`PackageData::persist`] is called.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, error, warn};

use crate::glob::{find_files, is_glob_pattern};
use crate::properties::PropertyStore;
use crate::xml::XmlElement;
use crate::{Result, StoreError, slash_path};

/// Name of the property file inside every package directory.
pub const PROPERTIES_FILENAME: &str = "info.properties";

/// Property recording the original file name.
pub const ORIGINAL_PROPERTY: &str = "_original_file";

/// Prefix separating parameters from plain properties.
pub const PARAMETER_PREFIX: &str = "parameter-";

/// Sub-directory holding copies of downloadable results.
const DOWNLOAD_DIR: &str = "download";

/// Creates and reopens packages under a single root directory.
#[derive(Debug, Clone)]
pub struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    /// Open a store, creating the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a package with this id would live in.
    pub fn package_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Create a package for `model`, copying `file` into it when given.
    ///
    /// The original file name is recorded and the properties are persisted
    /// before returning.
    pub fn new_package(&self, model: &str, file: Option<&Path>) -> Result<PackageData> {
        if let Some(source) = file
            && !source.is_file()
        {
            return Err(StoreError::SourceNotFound(source.to_path_buf()));
        }

        // create_dir fails on an existing directory, so claiming an id is atomic.
        let (id, dir) = loop {
            let id = generate_id(model);
            let dir = self.package_dir(&id);
            match std::fs::create_dir(&dir) {
                Ok(()) => break (id, dir),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StoreError::io(&dir, e)),
            }
        };
        debug!(package_id = %id, "Created package directory");

        let mut package = PackageData {
            id,
            created: Utc::now(),
            dir,
            original: None,
            properties: PropertyStore::new(),
        };

        if let Some(source) = file {
            let name = source
                .file_name()
                .ok_or_else(|| StoreError::SourceNotFound(source.to_path_buf()))?;
            let target = package.dir.join(name);
            std::fs::copy(source, &target).map_err(|e| StoreError::io(source, e))?;
            package
                .properties
                .set(ORIGINAL_PROPERTY, name.to_string_lossy().into_owned());
            package.original = Some(target);
        }

        package.persist()?;
        Ok(package)
    }

    /// Reopen an existing package.
    ///
    /// Returns `None` when no such package directory exists. Unreadable
    /// properties are logged and leave the package with what could be read.
    pub fn get_package(&self, id: &str) -> Option<PackageData> {
        if !is_valid_id(id) {
            return None;
        }
        let dir = self.package_dir(id);
        if !dir.is_dir() {
            return None;
        }

        let created = std::fs::metadata(&dir)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let mut package = PackageData {
            id: id.to_string(),
            created,
            dir,
            original: None,
            properties: PropertyStore::new(),
        };
        if let Err(e) = package.load_properties() {
            error!(package_id = %id, error = %e, "Cannot load package properties");
        }
        package.original = package
            .properties
            .get(ORIGINAL_PROPERTY)
            .map(|name| package.dir.join(name));
        Some(package)
    }

    /// Ids of every package directory under the root, sorted.
    pub fn list_packages(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(PROPERTIES_FILENAME).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// A package id is a single path segment.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

/// `MODEL-<hex millis mod 0xffffff>-<hex random>`, uppercase.
fn generate_id(model: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let random: u32 = rand::random_range(0..=0xffff);
    format!(
        "{}-{:X}-{:X}",
        model.to_uppercase(),
        millis % 0xffffff,
        random
    )
}

/// A single package: its directory, original file and properties.
#[derive(Debug, Clone)]
pub struct PackageData {
    id: String,
    created: DateTime<Utc>,
    dir: PathBuf,
    original: Option<PathBuf>,
    properties: PropertyStore,
}

impl PackageData {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// The package directory.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// The package directory with forward slashes.
    pub fn directory_path(&self) -> String {
        slash_path(&self.dir)
    }

    /// The original file inside the package, if one was supplied.
    pub fn original(&self) -> Option<&Path> {
        self.original.as_deref()
    }

    pub fn original_name(&self) -> Option<&str> {
        self.properties.get(ORIGINAL_PROPERTY)
    }

    /// Path of `file` relative to the package directory, with forward slashes.
    ///
    /// Returns `None` for files outside the package.
    pub fn relative_path(&self, file: &Path) -> Option<String> {
        let absolute = std::path::absolute(file).ok()?;
        let dir = std::path::absolute(&self.dir).ok()?;
        absolute
            .strip_prefix(&dir)
            .ok()
            .map(slash_path)
    }

    /// Resolve a package-relative path.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.dir.join(path.trim_start_matches(['/', '\\']))
    }

    /// First file matching `path`. See [`PackageData::get_files`].
    pub fn get_file(&self, path: &str) -> Option<PathBuf> {
        self.get_files(path).into_iter().next()
    }

    /// Files designated by `path`, relative to the package directory.
    ///
    /// An existing file of that exact name wins (names may contain `,` or
    /// `*`). Otherwise a comma-separated list yields each entry, a glob yields
    /// its matches, and anything else yields the literal path even when it
    /// does not exist yet.
    pub fn get_files(&self, path: &str) -> Vec<PathBuf> {
        if path.trim().is_empty() {
            return Vec::new();
        }

        let literal = self.resolve(path);
        if literal.exists() {
            return vec![literal];
        }

        if path.contains(',') {
            return path
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| self.resolve(p))
                .collect();
        }

        if is_glob_pattern(path) {
            return match find_files(path.trim_start_matches('/'), &self.dir) {
                Ok(files) => files,
                Err(e) => {
                    warn!(package_id = %self.id, pattern = path, error = %e, "Invalid file pattern");
                    Vec::new()
                }
            };
        }

        vec![literal]
    }

    /// First direct child whose extension matches, ignoring case.
    pub fn find_by_extension(&self, extension: &str) -> Option<PathBuf> {
        self.list_by_extension(extension).into_iter().next()
    }

    /// Direct children whose extension matches, ignoring case, sorted by name.
    pub fn list_by_extension(&self, extension: &str) -> Vec<PathBuf> {
        let wanted = extension.trim_start_matches('.');
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(wanted))
            })
            .collect();
        files.sort();
        files
    }

    /// Directory for downloadable copies, created on demand.
    pub fn download_dir(&self) -> Result<PathBuf> {
        let dir = self.dir.join(DOWNLOAD_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(dir)
    }

    /// Best-effort media type of the original file.
    pub fn media_type(&self) -> String {
        let Some(original) = &self.original else {
            return "unknown".to_string();
        };
        if original.is_dir() {
            return "text/directory".to_string();
        }
        let by_extension = original
            .extension()
            .and_then(|e| e.to_str())
            .and_then(media_type_for_extension);
        match by_extension {
            Some(media_type) => media_type.to_string(),
            None => self.property_or("contenttype", "unknown").to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.properties.get(&format!("{PARAMETER_PREFIX}{name}"))
    }

    pub fn set_parameter(&mut self, name: &str, value: impl Into<String>) {
        self.properties.set(format!("{PARAMETER_PREFIX}{name}"), value);
    }

    pub fn remove_parameter(&mut self, name: &str) -> Option<String> {
        self.properties.remove(&format!("{PARAMETER_PREFIX}{name}"))
    }

    /// All parameters, with the prefix stripped.
    pub fn parameters(&self) -> Vec<(String, String)> {
        self.properties
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(PARAMETER_PREFIX)
                    .map(|name| (name.to_string(), v.to_string()))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name)
    }

    pub fn property_or<'a>(&'a self, name: &str, fallback: &'a str) -> &'a str {
        self.properties.get(name).unwrap_or(fallback)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.set(name, value);
    }

    pub fn remove_property(&mut self, name: &str) -> Option<String> {
        self.properties.remove(name)
    }

    /// Plain properties, excluding parameters.
    pub fn properties(&self) -> Vec<(String, String)> {
        self.properties
            .iter()
            .filter(|(k, _)| !k.starts_with(PARAMETER_PREFIX))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Replace in-memory properties with the persisted ones.
    ///
    /// A package without a property file simply has no properties.
    pub fn load_properties(&mut self) -> Result<()> {
        let path = self.dir.join(PROPERTIES_FILENAME);
        if !path.exists() {
            return Ok(());
        }
        self.properties = PropertyStore::load(&path)?;
        Ok(())
    }

    /// Write the properties to `info.properties`.
    pub fn persist(&self) -> Result<()> {
        let path = self.dir.join(PROPERTIES_FILENAME);
        self.properties.save(&path, Some(&format!("package {}", self.id)))
    }

    pub fn to_xml(&self) -> XmlElement {
        let mut properties = XmlElement::new("properties");
        for (name, value) in self.properties() {
            properties.push(XmlElement::new("property").attr("name", name).attr("value", value));
        }
        let mut parameters = XmlElement::new("parameters");
        for (name, value) in self.parameters() {
            parameters.push(XmlElement::new("parameter").attr("name", name).attr("value", value));
        }

        let mut el = XmlElement::new("package-data")
            .attr("created", self.created.to_rfc3339_opts(SecondsFormat::Secs, true))
            .attr("id", &self.id)
            .attr("type", self.media_type())
            .child(properties)
            .child(parameters);

        if let Some(original) = &self.original {
            let name = original
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let size = std::fs::metadata(original).map(|m| m.len()).unwrap_or(0);
            el.push(XmlElement::new("file").attr("name", name).attr("size", size));
        }
        el
    }
}

fn media_type_for_extension(extension: &str) -> Option<&'static str> {
    let media_type = match extension.to_ascii_lowercase().as_str() {
        "xml" => "application/xml",
        "psml" => "application/vnd.pageseeder.psml+xml",
        "xsl" | "xslt" => "application/xslt+xml",
        "html" | "htm" => "text/html",
        "xhtml" => "application/xhtml+xml",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "zip" => "application/zip",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => return None,
    };
    Some(media_type)
}
