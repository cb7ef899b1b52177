//! The writeload payloads
//!
//! This library supports payload generation for the writeload project. Every
//! payload is a batch of line protocol points, the text format accepted by a
//! time-series database's `/write` endpoint.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    io::{self, Write},
    num::NonZeroU32,
};

use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;

pub use cpu_load_short::CpuLoadShort;
pub use cpu_load_short_wide::CpuLoadShortWide;
pub use line_protocol::{Point, Tag, TagValue};

pub mod common;
pub mod cpu_load_short;
pub mod cpu_load_short_wide;
pub mod line_protocol;

/// Errors related to serialization
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// IO operation failed
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Generate instances of `Self::Output` from a source of randomness.
///
/// Implementations are pure with respect to `rng`: the same generator and the
/// same RNG state always produce the same output.
pub trait Generator<'a> {
    /// The type produced by this generator.
    type Output: 'a;
    /// The error produced by this generator.
    type Error: 'a;

    /// Produce one `Self::Output`.
    ///
    /// # Errors
    ///
    /// Implementations return an error if an instance cannot be produced.
    fn generate<R>(&'a self, rng: &mut R) -> Result<Self::Output, Self::Error>
    where
        R: Rng + ?Sized;
}

/// To serialize into bytes
pub trait Serialize {
    /// Write a batch of `points` line protocol points into `writer`.
    ///
    /// Points are separated by a single newline. There is no trailing newline,
    /// so a batch of `n` points contains exactly `n - 1` newline characters.
    ///
    /// # Errors
    ///
    /// Returns an error if point generation or the underlying writer fails.
    fn to_bytes<W, R>(&self, rng: &mut R, points: NonZeroU32, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + ?Sized,
        W: Write;
}

/// Configuration for [`Payload`]
#[derive(Debug, Deserialize, serde::Serialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Config {
    /// Generates `cpu_load_short` points tagged with `host` and `region`
    CpuLoadShort(cpu_load_short::Config),
    /// Generates `cpu_load_short` points tagged with `host`, `host2`, `host3`
    /// and `region`
    CpuLoadShortWide(cpu_load_short_wide::Config),
}

impl Config {
    /// Determine whether the configured ranges are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if any range is empty or not finite.
    pub fn valid(&self) -> Result<(), Error> {
        match self {
            Config::CpuLoadShort(config) => config.valid(),
            Config::CpuLoadShortWide(config) => config.valid(),
        }
    }
}

/// A line protocol payload, one variant per [`Config`] variant.
#[derive(Debug, Clone)]
pub enum Payload {
    /// See [`CpuLoadShort`]
    CpuLoadShort(CpuLoadShort),
    /// See [`CpuLoadShortWide`]
    CpuLoadShortWide(CpuLoadShortWide),
}

impl Payload {
    /// Create a new [`Payload`] from its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not pass validation.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let payload = match config {
            Config::CpuLoadShort(config) => Self::CpuLoadShort(CpuLoadShort::new(config.clone())?),
            Config::CpuLoadShortWide(config) => {
                Self::CpuLoadShortWide(CpuLoadShortWide::new(config.clone())?)
            }
        };
        Ok(payload)
    }

    /// Generate a batch of `points` points as a single request body.
    ///
    /// # Errors
    ///
    /// See [`Serialize::to_bytes`].
    pub fn batch<R>(&self, rng: &mut R, points: NonZeroU32) -> Result<Bytes, Error>
    where
        R: Rng + ?Sized,
    {
        // Points from either variant are well under 128 bytes.
        let mut buf = Vec::with_capacity(points.get() as usize * 128);
        self.to_bytes(rng, points, &mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl Serialize for Payload {
    fn to_bytes<W, R>(&self, rng: &mut R, points: NonZeroU32, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + ?Sized,
        W: Write,
    {
        match self {
            Payload::CpuLoadShort(inner) => write_batch(inner, rng, points, writer),
            Payload::CpuLoadShortWide(inner) => write_batch(inner, rng, points, writer),
        }
    }
}

fn write_batch<G, R, W>(
    generator: &G,
    rng: &mut R,
    points: NonZeroU32,
    writer: &mut W,
) -> Result<(), Error>
where
    G: for<'a> Generator<'a, Output = Point<'a>, Error = Error>,
    R: Rng + ?Sized,
    W: Write,
{
    for idx in 0..points.get() {
        if idx > 0 {
            writer.write_all(b"\n")?;
        }
        let point = generator.generate(rng)?;
        write!(writer, "{point}")?;
    }
    Ok(())
}
