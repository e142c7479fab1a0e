//! Impls - concrete adapters for the ports.
//!
//! - **MemoryStore**: in-process `BackingStore`

pub mod memory_store;

pub use self::memory_store::MemoryStore;
