//! The daily orders pipeline.
//!
//! Declares `astro_orders` on top of the orderflow engine and exposes the
//! configuration and CLI used by the `orderflow` binary.

pub mod cli;
pub mod config;
pub mod orders;

pub use config::{LogFormat, PipelineSettings};
pub use orders::{build, OrdersPipeline};
