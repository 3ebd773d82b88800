//! Template engine module.
//!
//! Provides Jinja2-compatible rendering of SQL query templates using minijinja.

mod engine;

pub use engine::TemplateEngine;
