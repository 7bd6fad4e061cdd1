//! Concourse: a schemaless, versioned, transactional document-graph store.
//!
//! This crate is the top-level facade. The engine proper lives in
//! `concourse-core` (shared vocabulary: [`concourse_core::Value`],
//! [`concourse_core::Store`], [`concourse_core::Error`]), `concourse-buffer`
//! (the durable write-ahead log), `concourse-storage` (the indexed,
//! immutable Database), `concourse-concurrency` (the lock manager), and
//! `concourse-engine` (the composed environment, optimistic
//! `AtomicOperation`/`Transaction` writers). [`Concourse`] ties those
//! together behind one client-facing API and adds the two concerns that
//! don't belong in any single lower layer: JSON import/export ([`json`])
//! and session handles ([`session`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

mod concourse;
pub mod json;
pub mod session;

pub use concourse::Concourse;
pub use session::AccessToken;

pub use concourse_core::error::{Error, Result};
pub use concourse_core::value::{Operator, RecordId, TypeTag, Value};
pub use concourse_core::{Criteria, KeyOperatorCriteria, RecordView, Store};
pub use concourse_core::Config;
pub use concourse_engine::{Transaction, TransactionToken};
