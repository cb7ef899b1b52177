//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::net::SocketAddr;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::driver;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// The driver configuration is not usable.
    #[error("Invalid driver configuration: {0}")]
    Driver(#[from] driver::Error),
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
    /// The load driver to apply to the write endpoint
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub driver: driver::Config,
}

impl Config {
    /// Parse and validate a [`Config`] from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if `contents` is not a valid configuration.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver configuration does not pass validation.
    pub fn validate(&self) -> Result<(), Error> {
        self.driver.validate()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
/// Defines the manner of writeload's telemetry.
pub enum Telemetry {
    /// In prometheus mode writeload will emit its internal telemetry for
    /// scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}
