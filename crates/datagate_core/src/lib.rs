//! # datagate core
//!
//! Manifest-driven data access: a manifest of datasets, models and typed
//! properties describes data held by one or more backends, and requests
//! addressed by model name read and write that data through a uniform
//! query language.
//!
//! The crate is layered bottom-up:
//!
//! - [`dtype`]: property types with load, check and serialize rules.
//! - [`manifest`]: loading manifest documents and linking them into a
//!   [`Manifest`] with resolved references.
//! - [`commands`]: dispatch of handlers by argument kind.
//! - [`ufunc`]: resolving parsed query expressions into a [`Query`].
//! - [`backends`]: the [`Backend`] trait and the memory, SQL, document and
//!   tabular implementations.
//! - [`write`]: the write pipeline with revisions and the change log.
//! - [`result`] and [`stream`]: shaping rows into response records and
//!   rendering them chunk by chunk.
//! - [`store`]: the [`Store`] facade tying it together behind a
//!   transport-neutral request type.
//!
//! ## Example
//!
//! ```rust,ignore
//! use datagate_core::{load_yaml_str, Request, Store};
//! use serde_json::json;
//!
//! let manifest = load_yaml_str("type: model\nname: report\nproperties:\n  status: {type: string}\n")?;
//! let store = Store::in_memory(manifest)?;
//! store.bootstrap()?;
//!
//! let created = store.handle(Request::post("/report", json!({"status": "ok"})));
//! assert_eq!(created.status, 201);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod backends;
pub mod changes;
pub mod commands;
pub mod config;
pub mod dtype;
pub mod error;
pub mod format;
pub mod geometry;
pub mod manifest;
pub mod migration;
pub mod result;
pub mod store;
pub mod stream;
pub mod types;
pub mod ufunc;
pub mod urlparams;
pub mod value;
pub mod write;

pub use auth::{Authenticator, Caller};
pub use backends::Backend;
pub use changes::ChangeEntry;
pub use config::{BackendKind, Config, ManifestKind};
pub use dtype::DType;
pub use error::{CoreError, CoreResult, ErrorKind, ErrorReport};
pub use format::Format;
pub use manifest::load::load_yaml_str;
pub use manifest::{load_manifest, Manifest, Model, Property};
pub use migration::{plan_migration, SchemaAction, VersionChain};
pub use result::ResultBuilder;
pub use store::{Method, Request, Response, Store, StoreBuilder};
pub use stream::{CancelToken, ChunkedStream};
pub use types::{Action, Row};
pub use ufunc::Query;
pub use write::{DataItem, WriteOutcome, Writer};
