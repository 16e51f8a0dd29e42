use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Slot counts are non-zero
/// - The per-owner cap does not exceed the global slot count
/// - The adapter timeout is non-zero
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let engine = &config.engine;

    if engine.max_concurrent_processes == 0 {
        return Err(ConfigError::ValidationError(
            "engine.max_concurrent_processes cannot be 0".to_string(),
        ));
    }

    if engine.max_concurrent_per_user == 0 {
        return Err(ConfigError::ValidationError(
            "engine.max_concurrent_per_user cannot be 0".to_string(),
        ));
    }

    if engine.max_concurrent_per_user > engine.max_concurrent_processes {
        return Err(ConfigError::ValidationError(format!(
            "engine.max_concurrent_per_user ({}) exceeds engine.max_concurrent_processes ({})",
            engine.max_concurrent_per_user, engine.max_concurrent_processes
        )));
    }

    if engine.process_timeout == 0 {
        return Err(ConfigError::ValidationError(
            "engine.process_timeout cannot be 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_processes_fails() {
        let config = Config {
            engine: EngineConfig::default().with_max_concurrent_processes(0),
            ..Default::default()
        };
        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_per_user_above_global_fails() {
        let config = Config {
            engine: EngineConfig::default()
                .with_max_concurrent_processes(2)
                .with_max_concurrent_per_user(3),
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_timeout_fails() {
        let config = Config {
            engine: EngineConfig::default().with_process_timeout(0),
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }
}
