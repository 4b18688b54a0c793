use std::{env, path::Path, result::Result};

use config::{Config, ConfigError};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub endpoint: String,
    /// Credential secrets. Overridden by the `API_KEYS` env var
    /// (`;`-separated) when set.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Per-credential quota ceilings. Requests/min and requests/day are enforced
/// by the credential pool; tokens/min by the global pacer.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QuotaLimits {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
    pub tokens_per_minute: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub batch_token_budget: usize,
    pub max_attempts: u32,
    pub min_call_interval_ms: u64,
    pub checkpoint_every: usize,
    pub input_path: String,
    pub output_path: String,
    pub checkpoint_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub quotas: QuotaLimits,
    pub model: ModelConfig,
    pub run: RunConfig,
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        let mut cfg: AppConfig = builder.try_deserialize()?;

        if let Ok(keys) = env::var("API_KEYS") {
            cfg.api.keys = keys
                .split(';')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(path) = env::var("INPUT_PATH") {
            cfg.run.input_path = path;
        }
        if let Ok(path) = env::var("OUTPUT_PATH") {
            cfg.run.output_path = path;
        }

        Ok(cfg)
    }

    /// Loads `config.toml` from `APP_DIR`, falling back to the repository's
    /// `config/` directory during development.
    pub fn load() -> Result<Self, ConfigError> {
        let root = env::var("APP_DIR").unwrap_or_else(|_| {
            let dir = env::var("CARGO_MANIFEST_DIR")
                .expect("CARGO_MANIFEST_DIR or APP_DIR is required");
            Path::new(&dir).join("config").display().to_string()
        });
        Self::from_file(&format!("{root}/config"))
    }
}
