//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::directive::{parse_directives, Directive, DirectiveError};
use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading and directive dispatch.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
    #[error("Directive error: {0}")]
    Directive(#[from] DirectiveError),
    #[error("line {line}: `{command}`: {message}")]
    Command {
        line: usize,
        command: String,
        message: String,
    },
}

impl ConfigError {
    pub fn command(directive: &Directive, message: impl Into<String>) -> Self {
        ConfigError::Command {
            line: directive.line,
            command: directive.name.clone(),
            message: message.into(),
        }
    }
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Load and validate runtime configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Read and parse a directive file.
pub fn load_directives(path: &Path) -> Result<Vec<Directive>, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(parse_directives(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_joined() {
        let err = parse_config("[shared]\nmax_fds = 0\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation failed: shared.max_fds must be greater than zero, \
             shared.worker_threads (1) exceeds shared.max_fds (0)"
        );
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(parse_config("[shared\n"), Err(ConfigError::Parse(_))));
        assert!(matches!(
            parse_config("[shared]\nmax_fds = \"many\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_io() {
        let err = load_directives(Path::new("/nonexistent/plume.conf")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
