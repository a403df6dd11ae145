use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cpu,
    Gpu,
}

impl Backend {
    /// `cpu` selects the CPU; anything else, recognized or not, selects the
    /// accelerator.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("cpu") {
            Backend::Cpu
        } else {
            Backend::Gpu
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "cpu"),
            Backend::Gpu => write!(f, "gpu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub model_path: PathBuf,
    pub max_tokens: u32,
    pub backend: Backend,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub top_k: u32,
    pub top_p: f32,
    pub temperature: f32,
    pub enable_vision: bool,
}

/// One step of engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialResult {
    pub text: String,
    pub done: bool,
}

impl PartialResult {
    pub fn new(text: impl Into<String>, done: bool) -> Self {
        Self {
            text: text.into(),
            done,
        }
    }
}

pub type PartialStream = BoxStream<'static, anyhow::Result<PartialResult>>;

/// Builds engines from weights on disk. Called off the async runtime.
pub trait EngineLoader: Send + Sync {
    fn load(&self, options: &EngineOptions) -> anyhow::Result<Arc<dyn InferenceEngine>>;
}

pub trait InferenceEngine: Send + Sync {
    fn create_session(&self, options: &SessionOptions) -> anyhow::Result<Arc<dyn InferenceSession>>;
    fn close(&self) -> anyhow::Result<()>;
}

pub trait InferenceSession: Send + Sync {
    fn add_query_chunk(&self, text: &str) -> anyhow::Result<()>;

    /// Start generating from the queued input. The stream yields partial
    /// results in order; the last one has `done` set.
    fn generate(&self) -> anyhow::Result<PartialStream>;

    fn close(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse() {
        assert_eq!(Backend::parse("cpu"), Backend::Cpu);
        assert_eq!(Backend::parse(" CPU "), Backend::Cpu);
        assert_eq!(Backend::parse("gpu"), Backend::Gpu);
        assert_eq!(Backend::parse("npu"), Backend::Gpu);
        assert_eq!(Backend::parse(""), Backend::Gpu);
        assert_eq!(Backend::Cpu.to_string(), "cpu");
    }
}
