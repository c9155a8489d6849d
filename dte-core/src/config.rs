//! Configuration and environment selection.
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// RUT of the tax authority, used as the envelope receiver for boleta batches.
pub const SII_RUT: &str = "60803000-K";

/// SII environment selection for protocol endpoints.
/// - Certification: the "maullin" certification environment used while a
///   taxpayer is still being accredited.
/// - Production: the live "palena" environment.
///
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use dte_core::config::Environment;
///
/// let env = Environment::from_str("certification")?;
/// assert_eq!(env, Environment::Certification);
/// # Ok::<(), dte_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Certification,
    Production,
}

/// Error returned when parsing an [`Environment`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment: {input}")]
    Invalid { input: String },
}

impl FromStr for Environment {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<Environment, EnvironmentParseError> {
        match env.to_ascii_lowercase().as_str() {
            "certification" => Ok(Environment::Certification),
            "production" => Ok(Environment::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Certification => "certification",
            Environment::Production => "production",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            Environment::Certification => "https://maullin.sii.cl",
            Environment::Production => "https://palena.sii.cl",
        }
    }
}

/// Configuration for the protocol client and envelope assembler.
///
/// # Examples
/// ```rust
/// use dte_core::config::{Config, Environment};
///
/// let config = Config::new(Environment::Certification);
/// assert_eq!(config.authority_rut(), "60803000-K");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    env: Environment,
    authority_rut: String,
}

impl Config {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            authority_rut: SII_RUT.to_string(),
        }
    }

    /// Override the envelope-receiver RUT used for boleta batches.
    pub fn with_authority_rut(mut self, rut: impl Into<String>) -> Self {
        self.authority_rut = rut.into();
        self
    }

    pub fn env(&self) -> Environment {
        self.env
    }

    pub fn authority_rut(&self) -> &str {
        &self.authority_rut
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(Environment::Certification)
    }
}
