pub mod catalog;
pub mod dispatch;
pub mod download;
pub mod envconfig;
pub mod error;
pub mod events;
pub mod inference;
pub mod progress;

pub use catalog::{Catalog, CatalogEntry, JsonCatalog, ModelDescriptor, Resolver, StaticCatalog};
pub use dispatch::{Dispatcher, MethodCall};
pub use download::{
    DownloadEvent, DownloadExecutor, DownloadOrchestrator, DownloadRequest, DownloadState,
    HttpExecutor, ProgressState, TaskHandle,
};
pub use envconfig::EnvConfig;
pub use error::{Error, Precondition, Result};
pub use events::{EventChannel, Events, Reservation, Subscription};
pub use inference::{
    Backend, EngineLoader, GenerationEvent, InferenceEngine, InferenceParams, InferenceSession,
    InferenceSessionManager, PartialResult,
};
