//! The lock manager: fine-grained, ref-counted reader/writer locks keyed
//! by [`LockScope`] (spec §5).
//!
//! Locks are created on demand and garbage-collected once their reference
//! count falls to zero; creation and removal are serialized through the
//! same sharded map entry so the two can never race each other. Callers
//! that need more than one scope (an `AtomicOperation` committing several
//! intentions) should sort scopes with [`LockScope`]'s `Ord` impl before
//! acquiring them, which yields the canonical order spec §5 requires for
//! deadlock avoidance (record ascending, then key, then range start).

#![warn(missing_docs)]
#![warn(clippy::all)]

mod lock;
mod manager;

pub use lock::LockScope;
pub use manager::{LockManager, ReadGuard, WriteGuard};
