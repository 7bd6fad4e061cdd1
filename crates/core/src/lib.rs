//! Core types and traits for the Concourse storage engine.
//!
//! This crate defines the foundational vocabulary shared by every layer of
//! the store:
//! - [`Value`]/[`TypeTag`]/[`Operator`]: the tagged scalar and its ordering.
//! - [`Write`]/[`Action`]: the atomic unit of change.
//! - [`Clock`]: the process-wide monotonic version source.
//! - [`Store`]/[`Criteria`]: the shared read/write contract.
//! - [`Error`]: the error taxonomy (spec §7).
//! - [`Config`]: layered configuration (spec §6).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod operators;
pub mod replay;
pub mod search;
pub mod traits;
pub mod value;
pub mod write;

pub use clock::Clock;
pub use config::Config;
pub use error::{Error, Result};
pub use key::{is_reserved_identifier, is_valid_key, RESERVED_IDENTIFIER_KEY};
pub use traits::{Criteria, KeyOperatorCriteria, RecordView, Store};
pub use value::{Operator, RecordId, TypeTag, Value};
pub use write::{Action, Write};

/// A version timestamp: a point in the global, strictly monotonic write
/// order (spec §3).
pub type Version = u64;
