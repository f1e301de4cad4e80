//! Configuration management for the journal service
//!
//! Configuration is a small YAML file naming the primary and secondary
//! journal backends by URL (`zookeeper://...` or `nfs://...`). Every other
//! key in the file is forwarded verbatim to the coordination client as a
//! connection argument (e.g. a SASL mechanism), so site-specific client
//! options never need code changes. Command-line flags override file values;
//! a run with neither a primary nor a secondary configured is refused at
//! startup.

use std::collections::BTreeMap;
use std::fs;

use serde::Deserialize;
use thiserror::Error;

use crate::zk::ZkError;

/// Extra configuration keys forwarded to the coordination client verbatim.
pub type ConnArgs = BTreeMap<String, serde_yaml::Value>;

pub const DEFAULT_HISTORY_CACHE: usize = 50;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("error parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing primary and secondary journal")]
    MissingJournal,

    #[error("Missing primary journal")]
    MissingPrimary,

    #[error("Wrong zookeeper information")]
    WrongZookeeper,

    #[error("Unsupported journal type: {0}")]
    UnsupportedJournal(String),

    #[error("Error in Journal config")]
    BadResyncConfig,

    #[error(transparent)]
    Zk(#[from] ZkError),
}

/// On-disk shape of the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    primary: Option<String>,
    secondary: Option<String>,
    #[serde(flatten)]
    conn_args: ConnArgs,
}

/// Fully resolved journal configuration: file values with command-line
/// overrides applied.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub primary: Option<String>,
    pub secondary: Option<String>,
    pub cachesize: usize,
    pub adminuser: Option<String>,
    pub conn_args: ConnArgs,
}

impl JournalConfig {
    pub fn resolve(
        cfg_path: Option<&str>,
        primary: Option<String>,
        secondary: Option<String>,
        adminuser: Option<String>,
        cachesize: usize,
    ) -> Result<Self, ConfigError> {
        let file = match cfg_path {
            Some(path) => serde_yaml::from_str::<ConfigFile>(&fs::read_to_string(path)?)?,
            None => ConfigFile::default(),
        };
        Ok(JournalConfig {
            primary: primary.or(file.primary),
            secondary: secondary.or(file.secondary),
            cachesize,
            adminuser,
            conn_args: file.conn_args,
        })
    }

    /// At least one backend must be configured to run the server or CLI.
    pub fn require_any(&self) -> Result<(), ConfigError> {
        if self.primary.is_none() && self.secondary.is_none() {
            return Err(ConfigError::MissingJournal);
        }
        Ok(())
    }

    /// The workers drive the coordination backend directly; they require a
    /// `zookeeper*://` primary.
    pub fn zookeeper_primary(&self) -> Result<&str, ConfigError> {
        let primary = self.primary.as_deref().ok_or(ConfigError::MissingPrimary)?;
        let scheme = primary.split("://").next().unwrap_or("");
        if !scheme.contains("zookeeper") {
            return Err(ConfigError::WrongZookeeper);
        }
        Ok(primary)
    }

    /// Resync drains an `nfs://` secondary into the zookeeper primary.
    pub fn nfs_secondary_path(&self) -> Result<&str, ConfigError> {
        let secondary = self
            .secondary
            .as_deref()
            .ok_or(ConfigError::BadResyncConfig)?;
        match secondary.split_once("://") {
            Some((scheme, path)) if scheme.contains("nfs") => Ok(path),
            _ => Err(ConfigError::BadResyncConfig),
        }
    }
}
