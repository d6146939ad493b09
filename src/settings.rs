//! Layered service settings: built-in defaults, then an optional TOML file,
//! then `ILGUARD__<SECTION>__<KEY>` environment variables.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use ilguard_core::{ConfigError, ServiceConfig};
use thiserror::Error;

pub const ENV_PREFIX: &str = "ILGUARD";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Load and validate settings. A missing file is not an error.
pub fn load(path: Option<&Path>) -> Result<ServiceConfig, SettingsError> {
    load_with_env(path, Environment::with_prefix(ENV_PREFIX))
}

fn load_with_env(path: Option<&Path>, env: Environment) -> Result<ServiceConfig, SettingsError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }
    let settings: ServiceConfig = builder
        .add_source(env.separator(ENV_SEPARATOR).try_parsing(true))
        .build()?
        .try_deserialize()?;

    settings.validate()?;
    Ok(settings)
}
