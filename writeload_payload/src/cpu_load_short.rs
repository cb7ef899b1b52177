//! `cpu_load_short` payload, one host tag and a fixed region.
//!
//! Each point renders as
//! `cpu_load_short,host=server{host},region={region} value={value}`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Generator,
    common::{IdRange, ValueRange},
    line_protocol::{Point, TagValue},
};

pub(crate) const MEASUREMENT: &str = "cpu_load_short";
pub(crate) const FIELD: &str = "value";
pub(crate) const HOST_PREFIX: &str = "server";

pub(crate) fn default_value() -> ValueRange {
    ValueRange {
        min: 20.0,
        max: 100.0,
    }
}

pub(crate) fn default_host() -> IdRange {
    IdRange { min: 10, max: 40 }
}

fn default_region() -> String {
    "us-west".to_string()
}

/// Configuration for [`CpuLoadShort`]
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Range of the `value` field, default `[20, 100)`
    #[serde(default = "default_value")]
    pub value: ValueRange,
    /// Range of the `host` tag identifier, default `[10, 40]`
    #[serde(default = "default_host")]
    pub host: IdRange,
    /// Value of the `region` tag, default `us-west`
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            value: default_value(),
            host: default_host(),
            region: default_region(),
        }
    }
}

impl Config {
    /// Determine whether this configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if any range is invalid or the region is empty.
    pub fn valid(&self) -> Result<(), Error> {
        self.value.valid()?;
        self.host.valid()?;
        if self.region.is_empty() {
            return Err(Error::Validation("region must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// `cpu_load_short` payload
pub struct CpuLoadShort {
    config: Config,
}

impl CpuLoadShort {
    /// Construct a new instance of `CpuLoadShort`
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not pass validation.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.valid()?;
        Ok(Self { config })
    }
}

impl<'a> Generator<'a> for CpuLoadShort {
    type Output = Point<'a>;
    type Error = Error;

    fn generate<R>(&'a self, rng: &mut R) -> Result<Self::Output, Self::Error>
    where
        R: Rng + ?Sized,
    {
        let value = self.config.value.sample(rng);
        let host = self.config.host.sample(rng);

        Ok(Point::new(MEASUREMENT, FIELD, value)
            .tag("host", TagValue::id(HOST_PREFIX, host))
            .tag("region", TagValue::literal(&self.config.region)))
    }
}
