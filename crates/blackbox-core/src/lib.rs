//! Blackbox Core - shared configuration and error types
//!
//! This crate provides the session configuration (loading, defaults and
//! validation) and the top-level error type used by the Blackbox test
//! compilation engine and its command-line front end.

pub mod config;
pub mod error;

pub use config::{CompilationMode, CompilerConfig, Config, SessionConfig};
pub use error::{BlackboxError, ConfigError, Result};
