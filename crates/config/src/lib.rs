//! Configuration sources for the world database.
//!
//! Entity types, tiles, the environment layout and per-environment contents
//! are plain serde data, read from YAML or JSON chosen by file extension.
//!
//! # Layout
//! A layout file lists environments; each environment is either inline or
//! stored in its own file next to the layout.

mod schema;

pub use schema::{
    AvatarConfig, CloneMode, EntityConfig, EntityTypeConfig, EntityTypesConfig, EntryPointConfig,
    EnvironmentConfig, EnvironmentLayoutConfig, EnvironmentPlacementConfig, ModelConfig,
    TileConfig, TilesConfig, WorldConfig,
};

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported configuration format: {0:?}")]
    UnsupportedFormat(PathBuf),
    #[error("environment {0} has neither an inline definition nor a config file")]
    MissingEnvironmentSource(u16),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serialization format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Parse a document from text.
pub fn parse_str<T: DeserializeOwned>(text: &str, format: Format) -> Result<T, ConfigError> {
    match format {
        Format::Yaml => Ok(serde_yaml::from_str(text)?),
        Format::Json => Ok(serde_json::from_str(text)?),
    }
}

/// Read and parse a document, picking the format from the extension.
pub fn load_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let format = Format::from_path(path)?;
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(?path, ?format, "read configuration");
    parse_str(&text, format)
}

pub fn load_entity_types(path: impl AsRef<Path>) -> Result<EntityTypesConfig, ConfigError> {
    load_file(path)
}

pub fn load_tiles(path: impl AsRef<Path>) -> Result<TilesConfig, ConfigError> {
    load_file(path)
}

pub fn load_layout(path: impl AsRef<Path>) -> Result<EnvironmentLayoutConfig, ConfigError> {
    let layout: EnvironmentLayoutConfig = load_file(path)?;
    layout.validate()?;
    Ok(layout)
}

pub fn load_environment(path: impl AsRef<Path>) -> Result<EnvironmentConfig, ConfigError> {
    let env: EnvironmentConfig = load_file(path)?;
    env.validate()?;
    Ok(env)
}

pub fn load_avatar(path: impl AsRef<Path>) -> Result<AvatarConfig, ConfigError> {
    load_file(path)
}

pub fn load_world(path: impl AsRef<Path>) -> Result<WorldConfig, ConfigError> {
    let world: WorldConfig = load_file(path)?;
    world.validate()?;
    Ok(world)
}

impl EnvironmentPlacementConfig {
    /// Resolve the environment contents: the inline definition if present,
    /// otherwise `config_file` relative to `base_dir`.
    pub fn resolve(&self, base_dir: Option<&Path>) -> Result<EnvironmentConfig, ConfigError> {
        if let Some(env) = &self.environment {
            env.validate()?;
            return Ok(env.clone());
        }
        match (&self.config_file, base_dir) {
            (Some(file), Some(base)) => load_environment(base.join(file)),
            (Some(file), None) => load_environment(file),
            (None, _) => Err(ConfigError::MissingEnvironmentSource(self.id)),
        }
    }
}

pub fn crate_info() -> &'static str {
    "worldbase-config v0.1.0"
}
