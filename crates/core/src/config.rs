use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Process-wide configuration. Model identifiers select which external
/// collaborator is bound; retrieval knobs tune fusion; `output_language`
/// is a hard gate validated once at startup, never at query time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub output_language: String,
    pub models: ModelsConfig,
    pub paths: PathsConfig,
    pub retrieval: RetrievalConfig,
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub text_embedding_model: String,
    pub llm_model: String,
    pub vlm_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub sqlite_path: String,
    pub pages_dir: String,
    pub figures_dir: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub text_top_k: usize,
    pub visual_top_k: usize,
    pub rrf_k: f64,
    pub w_text: f64,
    pub w_visual: f64,
    pub max_evidence_items: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub index_lookup_ms: u64,
    pub generation_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_language: "en".to_string(),
            models: ModelsConfig::default(),
            paths: PathsConfig::default(),
            retrieval: RetrievalConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            text_embedding_model: "BAAI/bge-m3".to_string(),
            llm_model: "Qwen/Qwen2.5-7B-Instruct".to_string(),
            vlm_model: "Qwen/Qwen3-VL".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/metadata.sqlite3".to_string(),
            pages_dir: "data/pages".to_string(),
            figures_dir: "data/figures".to_string(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            text_top_k: 12,
            visual_top_k: 6,
            rrf_k: 60.0,
            w_text: 1.0,
            w_visual: 0.8,
            max_evidence_items: 16,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            index_lookup_ms: 10_000,
            generation_ms: 120_000,
        }
    }
}

impl AppConfig {
    /// Loads config from a JSON file, falling back to defaults when the file
    /// does not exist. Always validated before being handed out.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup gate: a non-English output language or missing model id is a
    /// fatal configuration error, not a runtime condition.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_language.trim().to_lowercase() != "en" {
            return Err(ConfigError::UnsupportedOutputLanguage(
                self.output_language.clone(),
            ));
        }
        if self.models.text_embedding_model.trim().is_empty() {
            return Err(ConfigError::MissingModel("text_embedding_model"));
        }
        if self.models.llm_model.trim().is_empty() {
            return Err(ConfigError::MissingModel("llm_model"));
        }
        if self.models.vlm_model.trim().is_empty() {
            return Err(ConfigError::MissingModel("vlm_model"));
        }
        Ok(())
    }
}
