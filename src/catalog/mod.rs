//! Model catalog lookup and the on-disk layout rule.
//!
//! Every path the crate touches for a model is derived here:
//! `<root>/<storage_dir>/<version>/<file_name>`. Download, presence checks and
//! engine initialization all go through [`ModelDescriptor::local_path`] so the
//! layout cannot drift between them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::envconfig::DEFAULT_VENDOR_PREFIX;
use crate::error::{Error, Result};

/// Version label used when a catalog record does not declare one.
pub const DEFAULT_VERSION: &str = "main";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub model_id: String,
    pub model_file: String,
    pub size_in_bytes: u64,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_config: Option<DefaultConfig>,
}

/// Per-model sampling defaults shipped with the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultConfig {
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Comma separated, most preferred first.
    #[serde(default)]
    pub accelerators: Option<String>,
}

impl DefaultConfig {
    pub fn preferred_accelerator(&self) -> Option<&str> {
        self.accelerators
            .as_deref()
            .and_then(|list| list.split(',').map(str::trim).find(|s| !s.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    models: Vec<CatalogEntry>,
}

fn parse_document(json: &str) -> Result<Vec<CatalogEntry>> {
    let doc: CatalogDocument =
        serde_json::from_str(json).map_err(|e| Error::Catalog(e.to_string()))?;
    Ok(doc.models)
}

/// Read-only source of catalog records.
pub trait Catalog: Send + Sync {
    fn entries(&self) -> Result<Vec<CatalogEntry>>;
}

/// Allowlist document on disk, re-read on every lookup.
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Catalog for JsonCatalog {
    fn entries(&self) -> Result<Vec<CatalogEntry>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Catalog(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        parse_document(&content)
    }
}

/// In-memory catalog, mostly for embedding a fixed allowlist and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(parse_document(json)?))
    }
}

impl Catalog for StaticCatalog {
    fn entries(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.entries.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub storage_dir: String,
    pub file_name: String,
    pub version: String,
    pub expected_size: u64,
    pub description: Option<String>,
    pub defaults: DefaultConfig,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, file_name: impl Into<String>, expected_size: u64) -> Self {
        let id = id.into();
        Self {
            storage_dir: storage_dir_name(&id, DEFAULT_VENDOR_PREFIX),
            id,
            file_name: file_name.into(),
            version: DEFAULT_VERSION.to_string(),
            expected_size,
            description: None,
            defaults: DefaultConfig::default(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn from_entry(entry: CatalogEntry, vendor_prefix: &str) -> Self {
        let version = entry
            .version
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());

        Self {
            storage_dir: storage_dir_name(&entry.model_id, vendor_prefix),
            id: entry.model_id,
            file_name: entry.model_file,
            version,
            expected_size: entry.size_in_bytes,
            description: entry.description,
            defaults: entry.default_config.unwrap_or_default(),
        }
    }

    pub fn download_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.storage_dir).join(&self.version)
    }

    pub fn local_path(&self, root: &Path) -> PathBuf {
        self.download_dir(root).join(&self.file_name)
    }

    pub fn default_source_url(&self, base: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}?download=true",
            base.trim_end_matches('/'),
            self.id,
            self.version,
            self.file_name
        )
    }
}

/// `google/gemma-3n` becomes `gemma-3n`: separators are flattened, then the
/// vendor prefix is stripped from the front only.
pub fn storage_dir_name(model_id: &str, vendor_prefix: &str) -> String {
    let flat = model_id.replace(['/', '\\'], "-");
    if vendor_prefix.is_empty() {
        return flat;
    }
    match flat.strip_prefix(vendor_prefix) {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => flat,
    }
}

#[derive(Clone)]
pub struct Resolver {
    catalog: Arc<dyn Catalog>,
    vendor_prefix: String,
}

impl Resolver {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            vendor_prefix: DEFAULT_VENDOR_PREFIX.to_string(),
        }
    }

    pub fn vendor_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.vendor_prefix = prefix.into();
        self
    }

    pub fn resolve(&self, model_id: &str) -> Result<ModelDescriptor> {
        self.catalog
            .entries()?
            .into_iter()
            .find(|entry| entry.model_id == model_id)
            .map(|entry| ModelDescriptor::from_entry(entry, &self.vendor_prefix))
            .ok_or_else(|| Error::NotFound(model_id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<ModelDescriptor>> {
        Ok(self
            .catalog
            .entries()?
            .into_iter()
            .map(|entry| ModelDescriptor::from_entry(entry, &self.vendor_prefix))
            .collect())
    }
}
