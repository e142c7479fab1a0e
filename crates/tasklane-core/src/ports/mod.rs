//! Ports - abstraction layer over external systems.
//!
//! The backing store is the only shared mutable resource in the engine; the
//! clock is abstracted so time-dependent logic stays testable.

pub mod clock;
pub mod store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::store::{BackingStore, ScoredMember, StoreError, glob_match};
