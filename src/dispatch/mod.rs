//! Routes host method calls onto the orchestrator and session manager.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::catalog::{storage_dir_name, ModelDescriptor, Resolver, DEFAULT_VERSION};
use crate::download::{DownloadOrchestrator, DownloadRequest, ExtraFile};
use crate::envconfig::DEFAULT_DOWNLOAD_BASE;
use crate::error::{Error, Precondition, Result};
use crate::inference::{Backend, InferenceParams, InferenceSessionManager};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Error body returned to the host: a stable code plus the message.
pub fn error_payload(err: &Error) -> Value {
    json!({ "code": err.code(), "message": err.to_string() })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadArgs {
    model_name: Option<String>,
    model_url: Option<String>,
    version: Option<String>,
    file_name: Option<String>,
    model_dir: Option<String>,
    total_bytes: Option<u64>,
    extra_data_urls: Option<String>,
    extra_data_file_names: Option<String>,
    access_token: Option<String>,
    #[serde(default)]
    is_zip: bool,
    unzipped_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelArgs {
    tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceArgs {
    model_id: Option<String>,
    file_name: Option<String>,
    model_dir: Option<String>,
    version: Option<String>,
    total_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeArgs {
    model_id: Option<String>,
    model_path: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_k: Option<u32>,
    top_p: Option<f32>,
    accelerator: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateArgs {
    prompt: Option<String>,
}

pub struct Dispatcher {
    resolver: Resolver,
    downloads: Arc<DownloadOrchestrator>,
    inference: Arc<InferenceSessionManager>,
    download_base: String,
    vendor_prefix: String,
}

impl Dispatcher {
    pub fn new(
        resolver: Resolver,
        downloads: Arc<DownloadOrchestrator>,
        inference: Arc<InferenceSessionManager>,
    ) -> Self {
        Self {
            resolver,
            downloads,
            inference,
            download_base: DEFAULT_DOWNLOAD_BASE.to_string(),
            vendor_prefix: crate::envconfig::DEFAULT_VENDOR_PREFIX.to_string(),
        }
    }

    pub fn download_base(mut self, base: impl Into<String>) -> Self {
        self.download_base = base.into();
        self
    }

    pub fn vendor_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.vendor_prefix = prefix.into();
        self
    }

    pub async fn handle(&self, call: MethodCall) -> Result<Value> {
        debug!("dispatch {}", call.method);
        match call.method.as_str() {
            "downloadModel" => self.download_model(parse_args(call.args)?),
            "cancelDownload" => Ok(self.cancel_download(parse_args(call.args)?)),
            "isModelDownloaded" => self.is_model_downloaded(parse_args(call.args)?),
            "initializeModel" => self.initialize_model(parse_args(call.args)?).await,
            "generateResponse" => self.generate_response(parse_args(call.args)?).await,
            "disposeModel" => {
                self.inference.dispose().await;
                Ok(Value::Bool(true))
            }
            other => Err(Error::NotImplemented(other.to_string())),
        }
    }

    fn download_model(&self, args: DownloadArgs) -> Result<Value> {
        let model_name = required(args.model_name, "modelName")?;

        let descriptor = match self.resolver.resolve(&model_name) {
            Ok(descriptor) => descriptor,
            Err(Error::NotFound(_)) => {
                let file_name = required(args.file_name, "fileName")?;
                let total_bytes = required(args.total_bytes, "totalBytes")?;
                let version =
                    non_empty(args.version).unwrap_or_else(|| DEFAULT_VERSION.to_string());
                let mut descriptor =
                    ModelDescriptor::new(&model_name, file_name, total_bytes).with_version(version);
                descriptor.storage_dir = non_empty(args.model_dir)
                    .unwrap_or_else(|| storage_dir_name(&model_name, &self.vendor_prefix));
                warn!("{} is not in the catalog, using caller-supplied layout", model_name);
                descriptor
            }
            Err(e) => return Err(e),
        };

        let source_url = non_empty(args.model_url)
            .unwrap_or_else(|| descriptor.default_source_url(&self.download_base));
        let extras = parse_extras(
            args.extra_data_urls.as_deref(),
            args.extra_data_file_names.as_deref(),
        )?;

        let mut request = DownloadRequest::new(descriptor, source_url)
            .extras(extras)
            .auth_token(args.access_token);
        if args.is_zip {
            request = request.archive(non_empty(args.unzipped_dir).map(PathBuf::from));
        }

        let handle = self.downloads.start(request)?;
        Ok(json!({ "taskId": handle.id().to_string(), "tag": handle.tag() }))
    }

    fn cancel_download(&self, args: CancelArgs) -> Value {
        let tag = args
            .tag
            .unwrap_or_else(|| self.downloads.download_tag().to_string());
        json!({ "cancelled": self.downloads.cancel(&tag) })
    }

    fn is_model_downloaded(&self, args: PresenceArgs) -> Result<Value> {
        let descriptor = match non_empty(args.model_id) {
            Some(model_id) => self.resolver.resolve(&model_id)?,
            None => {
                let file_name = required(args.file_name, "fileName")?;
                let model_dir = required(args.model_dir, "modelDir")?;
                let version = required(args.version, "version")?;
                let total_bytes = required(args.total_bytes, "totalBytes")?;
                let mut descriptor =
                    ModelDescriptor::new(&model_dir, file_name, total_bytes).with_version(version);
                descriptor.storage_dir = model_dir;
                descriptor
            }
        };
        Ok(Value::Bool(self.downloads.query_presence(&descriptor)))
    }

    async fn initialize_model(&self, args: InitializeArgs) -> Result<Value> {
        let model_id = non_empty(args.model_id);
        let explicit_path = non_empty(args.model_path).map(PathBuf::from);

        let (descriptor, model_path) = match model_id {
            Some(id) => match self.resolver.resolve(&id) {
                Ok(descriptor) => {
                    let path = descriptor.local_path(self.downloads.root());
                    if let Some(explicit) = &explicit_path {
                        if explicit != &path {
                            debug!("ignoring modelPath {:?} for catalog model {}", explicit, id);
                        }
                    }
                    (descriptor, path)
                }
                Err(Error::NotFound(_)) => {
                    let path = explicit_path.ok_or_else(|| Error::NotFound(id.clone()))?;
                    warn!("{} is not in the catalog, loading {:?} as given", id, path);
                    (ad_hoc_descriptor(&id, &path), path)
                }
                Err(e) => return Err(e),
            },
            None => {
                let path = explicit_path.ok_or(Precondition::MissingArgument("modelId".into()))?;
                let id = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (ad_hoc_descriptor(&id, &path), path)
            }
        };

        let mut params = InferenceParams::from_descriptor(&descriptor);
        if let Some(v) = args.max_tokens {
            params = params.max_tokens(v);
        }
        if let Some(v) = args.temperature {
            params = params.temperature(v);
        }
        if let Some(v) = args.top_k {
            params = params.top_k(v);
        }
        if let Some(v) = args.top_p {
            params = params.top_p(v);
        }
        if let Some(v) = args.accelerator {
            params = params.backend(Backend::parse(&v));
        }

        self.inference.initialize(&descriptor, &model_path, params).await?;
        Ok(Value::Bool(true))
    }

    async fn generate_response(&self, args: GenerateArgs) -> Result<Value> {
        let prompt = required(args.prompt, "prompt")?;
        self.inference.generate(&prompt).await?;
        Ok(Value::Null)
    }
}

fn parse_args<T: DeserializeOwned + Default>(args: Value) -> Result<T> {
    if args.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(args)?)
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| Precondition::MissingArgument(name.to_string()).into())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn ad_hoc_descriptor(id: &str, path: &Path) -> ModelDescriptor {
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    ModelDescriptor::new(id, file_name, size)
}

/// Pairs the comma-separated URL and file-name lists position by position.
fn parse_extras(urls: Option<&str>, names: Option<&str>) -> Result<Vec<ExtraFile>> {
    let split = |s: Option<&str>| -> Vec<String> {
        s.map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
    };
    let urls = split(urls);
    let names = split(names);

    if urls.len() != names.len() {
        return Err(Precondition::InvalidArgument(format!(
            "{} extra urls but {} extra file names",
            urls.len(),
            names.len()
        ))
        .into());
    }

    Ok(urls
        .into_iter()
        .zip(names)
        .map(|(url, file_name)| ExtraFile { url, file_name })
        .collect())
}
