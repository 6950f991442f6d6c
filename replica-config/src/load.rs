use serde::de::DeserializeOwned;

use crate::environment::Environment;

/// Directory containing configuration files relative to application root.
const CONFIGURATION_DIR: &str = "configuration";

/// Base configuration file loaded for all environments.
const BASE_CONFIG_FILE: &str = "base.yaml";

/// Prefix for environment variable configuration overrides.
const ENV_PREFIX: &str = "APP";

/// Separator between environment variable prefix and key segments.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
///
/// Example: `APP_WORKER__QUEUE_NAME` sets the `worker.queue_name` field.
const ENV_SEPARATOR: &str = "__";

/// Errors raised while loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    #[error("failed to parse APP_ENVIRONMENT: {0}")]
    Environment(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] rust_cli_config::ConfigError),
}

/// Loads hierarchical configuration from YAML files and environment variables.
///
/// Loads configuration in this order:
/// 1. Base configuration from `configuration/base.yaml`
/// 2. Environment-specific file from `configuration/{environment}.yaml`
/// 3. Environment variable overrides prefixed with `APP`
///
/// Nested keys use double underscores: `APP_WORKER__QUEUE_NAME` sets `worker.queue_name`.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    let configuration_directory = base_path.join(CONFIGURATION_DIR);

    let environment = Environment::load().map_err(LoadConfigError::Environment)?;
    let environment_filename = format!("{environment}.yaml");

    let environment_source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    let settings = rust_cli_config::Config::builder()
        .add_source(rust_cli_config::File::from(
            configuration_directory.join(BASE_CONFIG_FILE),
        ))
        // The environment file is optional so a bare `base.yaml` is enough to start.
        .add_source(
            rust_cli_config::File::from(configuration_directory.join(environment_filename))
                .required(false),
        )
        .add_source(environment_source)
        .build()?;

    Ok(settings.try_deserialize::<T>()?)
}
