mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, LogSettings, ServerSettings, Settings};

/// Prefix for environment overrides, e.g. `SUBPUB__SERVER__PORT=9000`.
const ENV_PREFIX: &str = "SUBPUB";

/// Loads `config/default` (any supported format, optional) plus environment
/// overrides, merged over the built-in defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    build(File::with_name("config/default").required(false))
}

/// Like [`load_config`], but reads the given file, which must exist.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    build(File::from(path.as_ref()).required(true))
}

fn build<S>(file: S) -> Result<Settings, ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let config = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
