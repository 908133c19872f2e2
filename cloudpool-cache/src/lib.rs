mod index;
pub mod store;
pub mod sweeper;

pub use store::{fingerprint, CacheConfig, CacheEntry, CacheHit, CacheStats, CacheStore, EntryState};
pub use sweeper::spawn_ttl_sweeper;
