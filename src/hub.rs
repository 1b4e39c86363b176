//! HuggingFace Hub integration for model resolution
//!
//! Resolves a model identifier to the local files needed to build the
//! tokenizer/model pair. Resolution tries the network-backed Hub API first
//! and falls back to the local Hub cache when the network is unavailable.

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::Api;
use hf_hub::Cache;
use std::path::{Path, PathBuf};

/// Files resolved for one model identifier.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Original model ID (e.g., "lmqg/t5-small-squad-qg") or local directory.
    pub model_id: String,
    /// Whether this came from a local directory rather than the Hub.
    pub is_local: bool,
    /// Path to config.json
    pub config_file: PathBuf,
    /// Path to model.safetensors
    pub weights_file: PathBuf,
    /// Path to tokenizer.json
    pub tokenizer_file: PathBuf,
}

/// Configuration read from the model's config.json.
///
/// Only the fields needed for family validation live here; the full value is
/// re-parsed into the candle T5 config by the model wrapper.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HubModelConfig {
    /// Model architectures (e.g., ["T5ForConditionalGeneration"])
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Model type (e.g., "t5", "mt5")
    pub model_type: Option<String>,

    /// Vocabulary size
    pub vocab_size: Option<usize>,
}

impl HubModelConfig {
    /// Load config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        serde_json::from_str(&content).context("Failed to parse config.json")
    }

    /// Get the model type, inferring from architectures if needed.
    pub fn get_model_type(&self) -> Option<String> {
        if let Some(model_type) = &self.model_type {
            return Some(model_type.clone());
        }
        for arch in &self.architectures {
            let arch_lower = arch.to_lowercase();
            if arch_lower.contains("mt5") {
                return Some("mt5".to_string());
            }
            if arch_lower.contains("t5") {
                return Some("t5".to_string());
            }
        }
        None
    }

    /// Validate that this config is one of the supported conditional-generation
    /// families. Anything other than t5/mt5 is a fatal error.
    pub fn validate_family(&self) -> Result<()> {
        match self.get_model_type().as_deref() {
            Some("t5") | Some("mt5") => Ok(()),
            other => Err(anyhow!(
                "unsupported model type: {:?} (supported: t5, mt5)",
                other
            )),
        }
    }
}

/// Model resolver handling local directories and the HuggingFace Hub.
pub struct ModelResolver {
    api: Option<Api>,
    cache: Cache,
}

impl ModelResolver {
    /// Create a new resolver.
    ///
    /// Hub API construction can fail (e.g., unusable cache location); the
    /// resolver still works for local directories and cached files in that
    /// case.
    pub fn new() -> Self {
        let api = match Api::new() {
            Ok(api) => Some(api),
            Err(e) => {
                tracing::warn!("Hub API unavailable, using local cache only: {}", e);
                None
            }
        };
        Self {
            api,
            cache: Cache::default(),
        }
    }

    /// Resolve a model identifier to its files.
    ///
    /// An existing local directory is used as-is. Otherwise each file is
    /// fetched through the Hub API, falling back to the local Hub cache when
    /// the network attempt fails.
    pub fn resolve(&self, model_id_or_path: &str) -> Result<ModelFiles> {
        let local_path = Path::new(model_id_or_path);
        if local_path.is_dir() {
            tracing::info!("Loading model from local path: {}", model_id_or_path);
            return Self::from_local(model_id_or_path);
        }
        if model_id_or_path.starts_with('.')
            || model_id_or_path.starts_with('/')
            || model_id_or_path.starts_with('~')
        {
            return Err(anyhow!(
                "Local model path does not exist: {}",
                model_id_or_path
            ));
        }

        tracing::info!("Resolving model from HuggingFace Hub: {}", model_id_or_path);
        let config_file = self.fetch(model_id_or_path, "config.json")?;
        let weights_file = self.fetch(model_id_or_path, "model.safetensors")?;
        let tokenizer_file = self.fetch(model_id_or_path, "tokenizer.json")?;

        Ok(ModelFiles {
            model_id: model_id_or_path.to_string(),
            is_local: false,
            config_file,
            weights_file,
            tokenizer_file,
        })
    }

    /// Fetch one file: network first, local Hub cache on failure.
    fn fetch(&self, model_id: &str, filename: &str) -> Result<PathBuf> {
        if let Some(api) = &self.api {
            match api.model(model_id.to_string()).get(filename) {
                Ok(path) => {
                    tracing::debug!("Resolved {} from Hub: {:?}", filename, path);
                    return Ok(path);
                }
                Err(e) => {
                    tracing::warn!(
                        "Hub fetch of {} failed ({}), trying local cache",
                        filename,
                        e
                    );
                }
            }
        }

        self.cache
            .model(model_id.to_string())
            .get(filename)
            .ok_or_else(|| {
                anyhow!(
                    "{} for '{}' not found on the Hub or in the local cache",
                    filename,
                    model_id
                )
            })
    }

    /// Build a ModelFiles from a local directory containing a Hub-format
    /// model (config.json, model.safetensors, tokenizer.json).
    fn from_local(path: impl AsRef<Path>) -> Result<ModelFiles> {
        let path = path.as_ref();
        let config_file = path.join("config.json");
        if !config_file.exists() {
            return Err(anyhow!("config.json not found in {:?}", path));
        }
        let weights_file = path.join("model.safetensors");
        if !weights_file.exists() {
            if path.join("pytorch_model.bin").exists() {
                return Err(anyhow!(
                    "only safetensors weights are supported; found pytorch_model.bin in {:?}",
                    path
                ));
            }
            return Err(anyhow!("model.safetensors not found in {:?}", path));
        }
        let tokenizer_file = path.join("tokenizer.json");
        if !tokenizer_file.exists() {
            return Err(anyhow!("tokenizer.json not found in {:?}", path));
        }

        Ok(ModelFiles {
            model_id: path
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            is_local: true,
            config_file,
            weights_file,
            tokenizer_file,
        })
    }

    /// Load and family-validate a model's config.
    pub fn load_config(&self, model_id_or_path: &str) -> Result<HubModelConfig> {
        let files = self.resolve(model_id_or_path)?;
        let config = HubModelConfig::from_file(&files.config_file)?;
        config.validate_family()?;
        Ok(config)
    }
}

impl Default for ModelResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_family_validation() {
        let config = HubModelConfig {
            architectures: vec!["T5ForConditionalGeneration".to_string()],
            model_type: Some("t5".to_string()),
            vocab_size: Some(32128),
        };
        assert!(config.validate_family().is_ok());

        let mt5 = HubModelConfig {
            architectures: vec![],
            model_type: Some("mt5".to_string()),
            vocab_size: Some(250112),
        };
        assert!(mt5.validate_family().is_ok());

        let bert = HubModelConfig {
            architectures: vec!["BertForMaskedLM".to_string()],
            model_type: Some("bert".to_string()),
            vocab_size: Some(30522),
        };
        let err = bert.validate_family().unwrap_err();
        assert!(err.to_string().contains("unsupported model type"));
    }

    #[test]
    fn test_model_type_inferred_from_architectures() {
        let config = HubModelConfig {
            architectures: vec!["MT5ForConditionalGeneration".to_string()],
            model_type: None,
            vocab_size: None,
        };
        assert_eq!(config.get_model_type(), Some("mt5".to_string()));
    }

    #[test]
    fn test_missing_local_path_is_error() {
        let resolver = ModelResolver::new();
        assert!(resolver
            .resolve("./no-such-model")
            .is_err_and(|e| e.to_string().contains("does not exist")));
    }

    #[test]
    fn test_local_dir_requires_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("config.json")).unwrap();
        writeln!(f, "{{}}").unwrap();
        std::fs::File::create(dir.path().join("pytorch_model.bin")).unwrap();

        let resolver = ModelResolver::new();
        let err = resolver
            .resolve(dir.path().to_str().unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("safetensors"));
    }
}
