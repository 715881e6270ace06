//! # hostvirt Common
//!
//! Shared utilities for the hostvirt components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use hostvirt_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(domain = "web-1", "Domain defined");
//! ```

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};
