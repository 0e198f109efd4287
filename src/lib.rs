#![forbid(unsafe_code)]

//! Comment import and reconciliation for videos from the official API and
//! the aggregator, persisted into a local libsql database.

pub mod commit;
pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod metadata;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;
pub mod source;
pub mod staging;
pub mod tagging;

pub use error::{ImportError, Result};
pub use pipeline::{ImportPipeline, PrepareResponse};
