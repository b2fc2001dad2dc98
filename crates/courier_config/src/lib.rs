//! courier_config
//!
//! Layered settings for the standalone broker and for clients: defaults, then
//! an optional `config/default.{toml,yaml,json}` file, then `COURIER_`
//! environment variables (`COURIER_SERVER__PORT=7000` sets `server.port`).

pub mod settings;


use config::{Config, ConfigError, Environment, File};

use crate::settings::PartialSettings;

pub use settings::{BrokerSettings, ClientSettings, ServerSettings, Settings};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Load settings from the default file location and the environment.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(DEFAULT_CONFIG_FILE, false)
}

/// Load settings from `path` (extension optional) and the environment.
///
/// With `required` set a missing file is an error, otherwise it is skipped.
pub fn load_config_from(path: &str, required: bool) -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name(path).required(required))
        .add_source(
            Environment::with_prefix("COURIER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge_onto(Settings::default()))
}
