//! This crate provides [`EntityLocker`], a two-tier synchronization
//! primitive for code that operates either on one identifiable entity or on
//! the entire entity space.
//!
//! # Motivation
//!
//! A data-access layer frequently needs to serialize "operate on entity X"
//! against other work on the same entity, while letting work on unrelated
//! entities proceed in parallel. Occasionally it also needs to run an
//! operation that must see the entire entity space quiescent, such as a
//! consistent scan or a bulk mutation.
//!
//! A single mutex serializes everything; a mutex per entity makes the
//! whole-space operation impossible to express. [`EntityLocker`] combines
//! both tiers:
//!
//! - [`EntityLocker::run_under_entity_lock`] runs a closure while holding a
//!   re-entrant lock keyed by an entity identity. Identities that compare
//!   equal share one lock; distinct identities do not contend.
//! - [`EntityLocker::run_under_global_lock`] runs a closure with every
//!   entity-scoped call excluded: it waits for in-flight entity work to
//!   finish and holds back new entity work until the closure returns.
//!
//! The identity can be any `Eq + Hash + Clone` type. Locks are created on
//! first use and removed as soon as no thread holds or waits for them, so
//! the locker's memory use is proportional to current contention, not to
//! the number of identities ever seen.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//! use entity_locker::EntityLocker;
//!
//! #[derive(PartialEq, Eq, Hash, Clone)]
//! struct AccountId(u64);
//!
//! let locker = Arc::new(EntityLocker::new());
//!
//! thread::scope(|s| {
//!     s.spawn(|| {
//!         locker.run_under_entity_lock(&AccountId(1), || {
//!             // Only one thread at a time runs here for account 1.
//!         });
//!     });
//!     s.spawn(|| {
//!         locker.run_under_entity_lock(&AccountId(2), || {
//!             // Runs in parallel with work on account 1.
//!         });
//!     });
//!     s.spawn(|| {
//!         locker.run_under_global_lock(|| {
//!             // No entity-scoped work is in flight anywhere.
//!         });
//!     });
//! });
//! ```
//!
//! # Guarantees
//!
//! - Mutual exclusion per identity, with re-entrancy for the holding thread.
//! - Full release of every acquired lock on every exit path, including
//!   panics unwinding out of the supplied closure.
//! - The global lock is writer-preferring: once a thread is waiting for it,
//!   no entity-scoped call from a thread without a lock is admitted, so its
//!   wait is bounded by the entity work already in flight. Threads already
//!   holding a lock may keep nesting calls, so they never deadlock against
//!   the waiting thread.
//!
//! Blocking is indefinite by default; the `try_*` variants offer
//! non-blocking and bounded-wait alternatives.

pub use locker::EntityLocker;

mod gate;
mod locker;
mod owner;
mod table;
