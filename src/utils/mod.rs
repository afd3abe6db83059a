// src/utils/mod.rs
//! Common utilities: configuration and errors

pub mod config;
pub mod errors;

pub use self::config::{
    BenchmarkConfig, BrokerConfig, BrokerKind, DocumentConfig, LogFormat, LoggingConfig,
    PipelineConfig, RelationalConfig, ServiceConfig, ServiceRole,
};
pub use errors::{PipelineError, Result};
