//! `cpu_load_short` payload with a wider tag set.
//!
//! Each point renders as
//! `cpu_load_short,host=server{h},host2=server{h2},host3=server{h2},region={r} value={v}`.
//! The `host2` and `host3` tags always share one draw.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Generator,
    common::{IdRange, ValueRange},
    cpu_load_short::{FIELD, HOST_PREFIX, MEASUREMENT, default_host, default_value},
    line_protocol::{Point, TagValue},
};

fn default_host2() -> IdRange {
    IdRange { min: 10, max: 100 }
}

fn default_region() -> IdRange {
    IdRange { min: 10, max: 100 }
}

/// Configuration for [`CpuLoadShortWide`]
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Range of the `value` field, default `[20, 100)`
    #[serde(default = "default_value")]
    pub value: ValueRange,
    /// Range of the `host` tag identifier, default `[10, 40]`
    #[serde(default = "default_host")]
    pub host: IdRange,
    /// Range of the shared `host2`/`host3` identifier, default `[10, 100]`
    #[serde(default = "default_host2")]
    pub host2: IdRange,
    /// Range of the `region` tag identifier, default `[10, 100]`
    #[serde(default = "default_region")]
    pub region: IdRange,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            value: default_value(),
            host: default_host(),
            host2: default_host2(),
            region: default_region(),
        }
    }
}

impl Config {
    /// Determine whether this configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if any range is invalid.
    pub fn valid(&self) -> Result<(), Error> {
        self.value.valid()?;
        self.host.valid()?;
        self.host2.valid()?;
        self.region.valid()
    }
}

#[derive(Debug, Clone, Copy)]
/// Wide `cpu_load_short` payload
pub struct CpuLoadShortWide {
    config: Config,
}

impl CpuLoadShortWide {
    /// Construct a new instance of `CpuLoadShortWide`
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not pass validation.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.valid()?;
        Ok(Self { config })
    }
}

impl<'a> Generator<'a> for CpuLoadShortWide {
    type Output = Point<'a>;
    type Error = Error;

    fn generate<R>(&'a self, rng: &mut R) -> Result<Self::Output, Self::Error>
    where
        R: Rng + ?Sized,
    {
        let value = self.config.value.sample(rng);
        let host = self.config.host.sample(rng);
        let host2 = self.config.host2.sample(rng);
        let region = self.config.region.sample(rng);

        Ok(Point::new(MEASUREMENT, FIELD, value)
            .tag("host", TagValue::id(HOST_PREFIX, host))
            .tag("host2", TagValue::id(HOST_PREFIX, host2))
            .tag("host3", TagValue::id(HOST_PREFIX, host2))
            .tag("region", TagValue::id("", region)))
    }
}
