//! orderflow tool library
//!
//! SQL-aware data movement for pipeline steps.
//!
//! This crate provides:
//! - Table and file references, resolved through named connections
//! - A DuckDB-backed warehouse and local object storage
//! - Step operators: load_file, transform, dataframe, merge, cleanup
//! - SQL query templates with Jinja2-compatible syntax

pub mod connection;
pub mod context;
pub mod error;
pub mod frame;
pub mod registry;
pub mod result;
pub mod storage;
pub mod table;
pub mod template;
pub mod tools;
pub mod warehouse;

pub use connection::ConnectionRegistry;
pub use context::{RunContext, TableSource};
pub use error::{ErrorKind, ToolError};
pub use frame::{Column, DataFrame};
pub use registry::{Operator, RetryConfig, StepConfig};
pub use result::{CleanupReport, StepOutput};
pub use table::{File, Table};
pub use warehouse::Warehouse;
