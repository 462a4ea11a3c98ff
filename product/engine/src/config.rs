use crate::extract::{
    ExtensionFilter, ExtensionFilterMode, ExtractOptions, DEFAULT_BATCH_SIZE, DEFAULT_MAX_IMAGES,
};
use crate::http::DEFAULT_USER_AGENT;
use crate::paths::AppPaths;
use crate::recognition::NamingRule;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT_SECS: u64 = 25;
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_images: usize,
    pub batch_size: usize,
    pub extension_filter: ExtensionFilterMode,
    pub image_extensions: Vec<String>,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_image_bytes: u64,
    /// Bucket that receives staged batches and recognized images.
    pub bucket: String,
    pub batch_prefix: String,
    pub recognized_prefix: String,
    pub naming_rule: NamingRule,
    /// Recognition endpoint; recognition commands fail without one.
    pub detector_endpoint: Option<String>,
    /// Name of the environment variable holding the detector bearer token.
    pub detector_token_env: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let filter = ExtensionFilter::default();
        Self {
            max_images: DEFAULT_MAX_IMAGES,
            batch_size: DEFAULT_BATCH_SIZE,
            extension_filter: filter.mode,
            image_extensions: filter.extensions,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            bucket: "findconnections-urls".to_string(),
            batch_prefix: "url-path".to_string(),
            recognized_prefix: "matches".to_string(),
            naming_rule: NamingRule::default(),
            detector_endpoint: None,
            detector_token_env: None,
        }
    }
}

impl PipelineConfig {
    pub fn extension_filter(&self) -> ExtensionFilter {
        ExtensionFilter {
            mode: self.extension_filter,
            extensions: self.image_extensions.clone(),
        }
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            max_images: self.max_images,
            batch_size: self.batch_size,
            filter: self.extension_filter(),
        }
    }

    pub fn detector_token(&self) -> Option<String> {
        let name = self.detector_token_env.as_deref()?.trim();
        if name.is_empty() {
            return None;
        }
        let raw = std::env::var(name).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EngineError::Validation(
                "batch_size must be a positive integer".to_string(),
            ));
        }
        if self.bucket.trim().is_empty() {
            return Err(EngineError::Validation("bucket must not be empty".to_string()));
        }
        Ok(())
    }
}

pub fn load_pipeline_config(paths: &AppPaths) -> Result<PipelineConfig> {
    let path = paths.pipeline_config_path();
    if !path.exists() {
        return Ok(PipelineConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: PipelineConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Parse(format!(
            "failed to parse pipeline config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn save_pipeline_config(paths: &AppPaths, config: &PipelineConfig) -> Result<()> {
    config.validate()?;
    let path = paths.pipeline_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
