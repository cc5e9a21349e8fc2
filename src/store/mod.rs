//! Concrete stores behind the repository and cache traits.
//!
//! `MemoryStore` backs tests and ephemeral runs; `SqliteStore` persists to
//! disk. Both implement the same trait surface from `mangaforge-common`, so
//! the orchestrator never knows which one it is driving.

pub mod cache;
pub mod memory;
pub mod sqlite;

pub use cache::MokaCache;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
