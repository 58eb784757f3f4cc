//! Extension entry loading
//!
//! The sandbox trusts the lifecycle collaborator to have validated and
//! installed the package. It only resolves the entry file inside the
//! install directory and reads it.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Default entry file when neither the descriptor nor `package.json` name one
pub const DEFAULT_ENTRY_POINT: &str = "index.js";

/// Resolved extension as handed over by the lifecycle collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescriptor {
    pub extension_id: String,
    pub install_path: PathBuf,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Entry file relative to `install_path`; `package.json` `main` is used
    /// when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ExtensionDescriptor {
    pub fn new(extension_id: impl Into<String>, install_path: impl Into<PathBuf>) -> Self {
        Self {
            extension_id: extension_id.into(),
            install_path: install_path.into(),
            permissions: Vec::new(),
            enabled: true,
            entry_point: None,
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Install path not found: {0}")]
    InstallPathNotFound(String),

    #[error("Entry point escapes the install directory: {0}")]
    OutsideInstallPath(String),

    #[error("Entry file not found: {0}")]
    EntryNotFound(String),

    #[error("Entry point is not a regular file: {0}")]
    NotAFile(String),

    #[error("Entry file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: usize },

    #[error("Invalid package.json: {0}")]
    Manifest(String),

    #[error("Failed to read entry file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct PackageManifest {
    #[serde(default)]
    main: Option<String>,
}

/// Resolve the entry file of an extension installed at `install_path`.
pub fn resolve_entry(install_path: &Path, entry_point: Option<&str>) -> Result<PathBuf, LoadError> {
    let root = install_path
        .canonicalize()
        .map_err(|_| LoadError::InstallPathNotFound(install_path.display().to_string()))?;

    let entry = match entry_point {
        Some(entry) => entry.to_string(),
        None => manifest_main(&root)?.unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string()),
    };

    let relative = Path::new(&entry);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(LoadError::OutsideInstallPath(entry));
    }

    let candidate = root.join(relative);
    let resolved = candidate
        .canonicalize()
        .map_err(|_| LoadError::EntryNotFound(entry.clone()))?;
    // symlinks pointing outside the package
    if !resolved.starts_with(&root) {
        return Err(LoadError::OutsideInstallPath(entry));
    }
    if !resolved.is_file() {
        return Err(LoadError::NotAFile(entry));
    }
    Ok(resolved)
}

/// Resolve and read the entry source, refusing files above `max_size`.
pub fn read_entry(
    install_path: &Path,
    entry_point: Option<&str>,
    max_size: usize,
) -> Result<String, LoadError> {
    let path = resolve_entry(install_path, entry_point)?;
    let size = std::fs::metadata(&path)?.len();
    if usize::try_from(size).map_or(true, |size| size > max_size) {
        return Err(LoadError::TooLarge {
            size,
            limit: max_size,
        });
    }
    Ok(std::fs::read_to_string(&path)?)
}

/// [`read_entry`] on the blocking pool, for callers on the async runtime.
pub async fn read_entry_blocking(
    install_path: PathBuf,
    entry_point: Option<String>,
    max_size: usize,
) -> Result<String, LoadError> {
    tokio::task::spawn_blocking(move || {
        read_entry(&install_path, entry_point.as_deref(), max_size)
    })
    .await
    .map_err(|e| LoadError::Io(std::io::Error::other(e.to_string())))?
}

fn manifest_main(root: &Path) -> Result<Option<String>, LoadError> {
    let manifest_path = root.join("package.json");
    if !manifest_path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&manifest_path)?;
    let manifest: PackageManifest =
        serde_json::from_str(&raw).map_err(|e| LoadError::Manifest(e.to_string()))?;
    Ok(manifest.main.filter(|main| !main.trim().is_empty()))
}
