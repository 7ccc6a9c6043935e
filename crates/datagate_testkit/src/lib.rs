//! # datagate testkit
//!
//! Test utilities for datagate.
//!
//! This crate provides:
//! - Sample manifests and store helpers
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use datagate_testkit::prelude::*;
//!
//! #[test]
//! fn reports_round_trip() {
//!     let store = TestStore::memory(REPORT);
//!     let created = store.post("/report", json!({"status": "ok"}));
//!     assert_eq!(created.status, 201);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use datagate_core::{Method, Request, Response, Store};
    pub use serde_json::{json, Value};
}

pub use fixtures::*;
pub use generators::*;
