//! Core engine modules - store, index, scheduling, workers
//!
//! These modules form the frame cache, independent of any UI.

pub mod cache;
pub mod frame_index;
pub mod ranges;
pub mod scheduler;
pub mod shadow;
pub mod stats;
pub mod store;
pub mod types;
pub mod utility;
pub mod workers;

// Re-exports for convenience
pub use cache::{CacheState, FrameCache, MetadataReport};
pub use scheduler::{Booking, CacheTarget, DEFAULT_IN_FLIGHT_TIMEOUT};
pub use stats::CacheStats;
pub use store::{ContentStore, MemoryStore};
pub use types::{Frame, FrameRange, IdTree, Item, ItemId, ProducerId, TreeResult};
pub use utility::{CachingMode, EvictionPolicy, FreeMode, LookaheadPolicy, PlaybackState, RegionPolicy, UtilityMode};
pub use workers::{CacheWorkers, FrameProducer};
