//! The writeload time-series write endpoint load generation tool.
//!
//! This library supports the writeload binary found elsewhere in this project.
//! A run fans out a fixed number of workers, each of which POSTs batches of
//! line protocol to a `/write` endpoint and stops at the first failure. The
//! run passes only if every worker completes every iteration.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use bytes::Bytes;
use http_body_util::Full;

pub mod config;
pub mod driver;
pub mod sink;

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> Full<Bytes> {
    Full::new(chunk.into())
}
