//! Core types: errors and engine configuration.

pub mod config;
pub mod error;

pub use config::EngineConfig;
pub use error::NetError;
