//! Late-bound provider registry.
//!
//! Maps provider names to adapter factories, one table per capability.
//! Populated with the built-ins at process start; embedders can register
//! additional providers before the gateway is built. Factories validate their
//! provider block and fail with `Config`; backend reachability is checked on
//! first use, not at registration.

use crate::config::{EngineConfig, EnginesConfig};
use crate::engine::mock::{MockAsr, MockLlm, MockTts};
use crate::engine::openai::{OpenAiAsr, OpenAiLlm, OpenAiTts};
use crate::engine::{AsrEngine, EngineSet, LlmEngine, TtsEngine};
use crate::error::{GatewayError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

type AsrFactory = Box<dyn Fn(&EngineConfig) -> Result<Arc<dyn AsrEngine>> + Send + Sync>;
type LlmFactory = Box<dyn Fn(&EngineConfig) -> Result<Arc<dyn LlmEngine>> + Send + Sync>;
type TtsFactory = Box<dyn Fn(&EngineConfig) -> Result<Arc<dyn TtsEngine>> + Send + Sync>;

/// Provider-name → factory tables for the three capabilities.
pub struct EngineRegistry {
    asr: HashMap<String, AsrFactory>,
    llm: HashMap<String, LlmFactory>,
    tts: HashMap<String, TtsFactory>,
}

impl EngineRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            asr: HashMap::new(),
            llm: HashMap::new(),
            tts: HashMap::new(),
        }
    }

    /// A registry with the built-in `mock` and `openai` providers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_asr("mock", |cfg| Ok(Arc::new(MockAsr::from_config(cfg)?)));
        registry.register_llm("mock", |cfg| Ok(Arc::new(MockLlm::from_config(cfg)?)));
        registry.register_tts("mock", |cfg| Ok(Arc::new(MockTts::from_config(cfg)?)));
        registry.register_asr("openai", |cfg| Ok(Arc::new(OpenAiAsr::from_config(cfg)?)));
        registry.register_llm("openai", |cfg| Ok(Arc::new(OpenAiLlm::from_config(cfg)?)));
        registry.register_tts("openai", |cfg| Ok(Arc::new(OpenAiTts::from_config(cfg)?)));
        registry
    }

    /// Register (or replace) an ASR provider.
    pub fn register_asr(
        &mut self,
        name: &str,
        factory: impl Fn(&EngineConfig) -> Result<Arc<dyn AsrEngine>> + Send + Sync + 'static,
    ) {
        self.asr.insert(name.to_owned(), Box::new(factory));
    }

    /// Register (or replace) an LLM provider.
    pub fn register_llm(
        &mut self,
        name: &str,
        factory: impl Fn(&EngineConfig) -> Result<Arc<dyn LlmEngine>> + Send + Sync + 'static,
    ) {
        self.llm.insert(name.to_owned(), Box::new(factory));
    }

    /// Register (or replace) a TTS provider.
    pub fn register_tts(
        &mut self,
        name: &str,
        factory: impl Fn(&EngineConfig) -> Result<Arc<dyn TtsEngine>> + Send + Sync + 'static,
    ) {
        self.tts.insert(name.to_owned(), Box::new(factory));
    }

    /// Build the ASR adapter for a provider block.
    ///
    /// # Errors
    ///
    /// `UnsupportedProvider` for an unregistered name; factory errors pass
    /// through.
    pub fn build_asr(&self, config: &EngineConfig) -> Result<Arc<dyn AsrEngine>> {
        let factory = self
            .asr
            .get(&config.provider)
            .ok_or_else(|| GatewayError::UnsupportedProvider(config.provider.clone()))?;
        factory(config)
    }

    /// Build the LLM adapter for a provider block.
    ///
    /// # Errors
    ///
    /// `UnsupportedProvider` for an unregistered name; factory errors pass
    /// through.
    pub fn build_llm(&self, config: &EngineConfig) -> Result<Arc<dyn LlmEngine>> {
        let factory = self
            .llm
            .get(&config.provider)
            .ok_or_else(|| GatewayError::UnsupportedProvider(config.provider.clone()))?;
        factory(config)
    }

    /// Build the TTS adapter for a provider block.
    ///
    /// # Errors
    ///
    /// `UnsupportedProvider` for an unregistered name; factory errors pass
    /// through.
    pub fn build_tts(&self, config: &EngineConfig) -> Result<Arc<dyn TtsEngine>> {
        let factory = self
            .tts
            .get(&config.provider)
            .ok_or_else(|| GatewayError::UnsupportedProvider(config.provider.clone()))?;
        factory(config)
    }

    /// Build the full engine set from configuration.
    ///
    /// # Errors
    ///
    /// Propagates the first provider lookup or factory failure.
    pub fn build(&self, config: &EnginesConfig) -> Result<EngineSet> {
        let set = EngineSet {
            asr: self.build_asr(&config.asr)?,
            llm: self.build_llm(&config.llm)?,
            tts: self.build_tts(&config.tts)?,
        };
        info!(
            asr = %set.asr.descriptor().provider,
            llm = %set.llm.descriptor().provider,
            tts = %set.tts.descriptor().provider,
            "engine set built"
        );
        Ok(set)
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
