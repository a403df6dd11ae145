use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Model not found in catalog: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(#[from] Precondition),

    #[error("Failed to initialize model: {0}")]
    InitializationFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Failed to dispose model: {0}")]
    DisposeFailed(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Method not implemented: {0}")]
    NotImplemented(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Precondition {
    #[error("model not initialized")]
    NoModel,

    #[error("a generation is already running on this session")]
    GenerationInProgress,

    #[error("missing required argument `{0}`")]
    MissingArgument(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Stable code reported alongside the message to the host UI.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::PreconditionFailed(p) => match p {
                Precondition::NoModel => "NO_MODEL",
                Precondition::GenerationInProgress => "BUSY",
                Precondition::MissingArgument(name) if name == "prompt" => "NO_PROMPT",
                Precondition::MissingArgument(_) | Precondition::InvalidArgument(_) => {
                    "INVALID_ARGS"
                }
            },
            Error::InitializationFailed(_) => "INIT_ERROR",
            Error::DownloadFailed(_) => "DOWNLOAD_ERROR",
            Error::DisposeFailed(_) => "DISPOSE_ERROR",
            Error::Inference(_) => "INFERENCE_ERROR",
            Error::NotImplemented(_) => "NOT_IMPLEMENTED",
            Error::Catalog(_) => "CATALOG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "INVALID_ARGS",
        }
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::PreconditionFailed(_))
    }
}
