//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_session(config)?;
    validate_compiler(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_session(config: &Config) -> Result<()> {
    if config.session.target.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "session.target".to_string(),
            message: "target cannot be empty".to_string(),
        }
        .into());
    }

    if config.session.concurrency == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: "session.concurrency".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into());
    }

    if config.session.run_timeout_secs == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: "session.run_timeout_secs".to_string(),
            message: "must be at least 1 second".to_string(),
        }
        .into());
    }

    Ok(())
}

fn validate_compiler(config: &Config) -> Result<()> {
    if config.compiler.program.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "compiler.program".to_string(),
            message: "program cannot be empty".to_string(),
        }
        .into());
    }

    for (field, extension) in [
        ("compiler.library_extension", &config.compiler.library_extension),
        ("compiler.executable_extension", &config.compiler.executable_extension),
    ] {
        if extension.starts_with('.') || extension.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: "must be a bare extension such as \"klib\"".to_string(),
            }
            .into());
        }
    }

    if config.compiler.library_extension == config.compiler.executable_extension
        && !config.compiler.library_extension.is_empty()
    {
        return Err(ConfigError::InvalidValue {
            field: "compiler.executable_extension".to_string(),
            message: "must differ from compiler.library_extension".to_string(),
        }
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_empty_target_rejected() {
        let mut config = Config::default();
        config.session.target = "  ".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("session.target"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.session.concurrency = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_dotted_extension_rejected() {
        let mut config = Config::default();
        config.compiler.library_extension = ".klib".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("library_extension"));
    }

    #[test]
    fn test_identical_extensions_rejected() {
        let mut config = Config::default();
        config.compiler.executable_extension = "klib".to_string();
        assert!(validate_config(&config).is_err());
    }
}
