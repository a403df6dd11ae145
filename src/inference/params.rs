use std::path::PathBuf;

use super::engine::{Backend, EngineOptions, SessionOptions};
use crate::catalog::ModelDescriptor;

pub const DEFAULT_MAX_TOKENS: u32 = 8192;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_ACCELERATOR: &str = "gpu";

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub backend: Backend,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_k: DEFAULT_TOP_K,
            top_p: DEFAULT_TOP_P,
            backend: Backend::parse(DEFAULT_ACCELERATOR),
        }
    }
}

impl InferenceParams {
    /// Host defaults overlaid with whatever the catalog ships for the model.
    pub fn from_descriptor(descriptor: &ModelDescriptor) -> Self {
        let defaults = &descriptor.defaults;
        let base = Self::default();
        Self {
            max_tokens: defaults.max_tokens.unwrap_or(base.max_tokens),
            temperature: defaults.temperature.unwrap_or(base.temperature),
            top_k: defaults.top_k.unwrap_or(base.top_k),
            top_p: defaults.top_p.unwrap_or(base.top_p),
            backend: defaults
                .preferred_accelerator()
                .map(Backend::parse)
                .unwrap_or(base.backend),
        }
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn top_k(mut self, k: u32) -> Self {
        self.top_k = k;
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn engine_options(&self, model_path: impl Into<PathBuf>) -> EngineOptions {
        EngineOptions {
            model_path: model_path.into(),
            max_tokens: self.max_tokens,
            backend: self.backend,
        }
    }

    /// Vision input is always off.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
            enable_vision: false,
        }
    }
}
