//! PLAYA frame cache - frame-aware caching and eviction for playback
//!
//! Re-exports all modules for use by binary targets.

// Core engine (store, index, scheduler, workers)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod sim;

// Re-export commonly used types from core
pub use core::cache::{CacheState, FrameCache};
pub use core::store::{ContentStore, MemoryStore};
pub use core::types::{Frame, IdTree, Item, ItemId, ProducerId};
pub use core::workers::{CacheWorkers, FrameProducer};
