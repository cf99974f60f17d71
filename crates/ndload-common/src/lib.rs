//! ndload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, configuration loading, and error handling for the ndload
//! workspace.
//!
//! # Overview
//!
//! - **Types**: destination configuration, column descriptors and the storage /
//!   ingestion strategy enums
//! - **Config**: YAML loader configuration with connection-string interpolation
//! - **Error Handling**: shared error type and result alias
//! - **Logging**: tracing subscriber bootstrap for the binaries
//!
//! # Example
//!
//! ```no_run
//! use ndload_common::config::LoaderConfig;
//!
//! fn main() -> ndload_common::Result<()> {
//!     let config = LoaderConfig::load("ndload.yml")?;
//!     for destination in config.namespace("analytics")? {
//!         println!("{} -> {}", destination.id, destination.table);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod interpolate;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use config::LoaderConfig;
pub use error::{NdloadError, Result};
pub use types::{
    ColumnDescriptor, DestinationConfig, DestinationId, IngestionStrategy, StorageStrategy,
};
