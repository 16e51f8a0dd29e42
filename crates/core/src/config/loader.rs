use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Option names recognised without prefix, mapped onto `engine.*`.
const ENGINE_ENV_KEYS: &[&str] = &[
    "MAX_FILE_SIZE",
    "MAX_CONCURRENT_PROCESSES",
    "MAX_CONCURRENT_PER_USER",
    "PROCESS_TIMEOUT",
    "MAX_RETRIES",
    "RETENTION_DAYS",
];

fn with_env(figment: Figment) -> Figment {
    figment
        .merge(Env::prefixed("CONVERTD_").split("__"))
        .merge(
            Env::raw()
                .only(ENGINE_ENV_KEYS)
                .map(|key| format!("engine.{}", key.as_str().to_ascii_lowercase()).into()),
        )
}

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::file(path));

    with_env(figment)
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Load configuration from defaults and the environment only
pub fn load_config_from_env() -> Result<Config, ConfigError> {
    with_env(Figment::from(Serialized::defaults(Config::default())))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}
