use std::env;
use std::path::PathBuf;

pub const DEFAULT_DOWNLOAD_BASE: &str = "https://huggingface.co";
pub const DEFAULT_VENDOR_PREFIX: &str = "google-";
pub const DEFAULT_DOWNLOAD_TAG: &str = "model_download";
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub models_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub download_base: String,
    pub vendor_prefix: String,
    pub download_tag: String,
    pub event_buffer: usize,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            models_dir: models_dir(),
            catalog_path: catalog_path(),
            download_base: env::var("GALLERY_DOWNLOAD_BASE")
                .unwrap_or_else(|_| DEFAULT_DOWNLOAD_BASE.to_string()),
            vendor_prefix: env::var("GALLERY_VENDOR_PREFIX")
                .unwrap_or_else(|_| DEFAULT_VENDOR_PREFIX.to_string()),
            download_tag: env::var("GALLERY_DOWNLOAD_TAG")
                .unwrap_or_else(|_| DEFAULT_DOWNLOAD_TAG.to_string()),
            event_buffer: env::var("GALLERY_EVENT_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_EVENT_BUFFER),
        }
    }

    /// Config rooted at `models_dir` with every other value at its default.
    pub fn with_root(models_dir: impl Into<PathBuf>) -> Self {
        let models_dir = models_dir.into();
        Self {
            catalog_path: models_dir.join("model_allowlist.json"),
            models_dir,
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
            vendor_prefix: DEFAULT_VENDOR_PREFIX.to_string(),
            download_tag: DEFAULT_DOWNLOAD_TAG.to_string(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

pub fn models_dir() -> PathBuf {
    let path = env::var("GALLERY_MODELS").unwrap_or_else(|_| "~/.gallery/models".to_string());
    expand_home(&path)
}

pub fn catalog_path() -> PathBuf {
    let path = env::var("GALLERY_CATALOG")
        .unwrap_or_else(|_| "~/.gallery/model_allowlist.json".to_string());
    expand_home(&path)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
