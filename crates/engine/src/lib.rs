//! The layered store's upper half: [`BufferedStore`] (Buffer + Database
//! composition), [`Engine`] (environment lifecycle, lock manager, inventory,
//! the facade clients actually call), [`AtomicOperation`]/[`Transaction`]
//! (optimistic, version-validated write composition), and [`Transporter`]
//! (the background Buffer → Database mover).
//!
//! Layout mirrors spec §9's "polymorphic store layers": every type in this
//! crate implements [`concourse_core::Store`], and `AtomicOperation`/
//! `Transaction` compose their destination by reference (an `Arc<Engine>`)
//! rather than inheriting from it.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod atomic;
mod buffered_store;
mod engine;
mod transaction;
mod transporter;

pub use atomic::{execute_with_retry, AtomicOperation, RetryPolicy};
pub use buffered_store::BufferedStore;
pub use engine::{Engine, EngineConfig};
pub use transaction::{Transaction, TransactionToken};
pub use transporter::{Transporter, TransporterHandle, TransporterMode};
