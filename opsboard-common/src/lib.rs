//! # opsboard Common
//!
//! Shared utilities for the opsboard components.
//!
//! ## Logging
//!
//! ```rust
//! opsboard_common::init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
