//! Node configuration

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tecdsa_core::chain::Address;
use tecdsa_core::Parameters;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Node configuration, usually read from a TOML file
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub keep: KeepConfig,
    /// Seconds a member waits for one protocol round
    pub round_timeout_secs: u64,
    /// Seconds to wait for a requested signature to land on chain
    pub signing_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeepConfig {
    /// Keep contract address, hex encoded
    pub address: String,
    pub members: usize,
    pub honest_threshold: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            keep: KeepConfig::default(),
            round_timeout_secs: 30,
            signing_timeout_secs: 120,
        }
    }
}

impl Default for KeepConfig {
    fn default() -> Self {
        Self {
            address: "00000000000000000000000000000000000000aa".into(),
            members: 3,
            honest_threshold: 2,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep.members == 0 {
            return Err(ConfigError::Invalid("keep needs at least one member".into()));
        }
        if self.keep.honest_threshold == 0 || self.keep.honest_threshold > self.keep.members {
            return Err(ConfigError::Invalid(format!(
                "honest threshold {} must be between 1 and {}",
                self.keep.honest_threshold, self.keep.members
            )));
        }
        if self.round_timeout_secs == 0 {
            return Err(ConfigError::Invalid("round timeout must be positive".into()));
        }
        self.keep_address()?;
        Ok(())
    }

    pub fn keep_address(&self) -> Result<Address, ConfigError> {
        let address = self.keep.address.trim_start_matches("0x");
        hex::decode(address)
            .ok()
            .and_then(|bytes| Address::try_from(bytes).ok())
            .ok_or_else(|| {
                ConfigError::Invalid(format!("keep address {} is not 20 hex bytes", self.keep.address))
            })
    }

    pub fn parameters(&self) -> Parameters {
        Parameters::default().with_round_timeout(Duration::from_secs(self.round_timeout_secs))
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.signing_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = NodeConfig::parse(
            r#"
            round_timeout_secs = 5

            [keep]
            address = "0x1111111111111111111111111111111111111111"
            members = 5
            honest_threshold = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.keep.members, 5);
        assert_eq!(config.keep_address().unwrap(), [0x11; 20]);
        assert_eq!(config.parameters().round_timeout, Duration::from_secs(5));
        assert_eq!(config.signing_timeout_secs, 120);
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::parse("").unwrap();
        assert_eq!(config.keep.members, 3);
        assert_eq!(config.keep.honest_threshold, 2);
    }

    #[test]
    fn test_rejects_bad_threshold_and_address() {
        assert!(matches!(
            NodeConfig::parse("[keep]\nmembers = 2\nhonest_threshold = 3\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::parse("[keep]\naddress = \"abcd\"\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            NodeConfig::parse("unknown = 1\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
