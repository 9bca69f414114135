//! Profile Cache (C3): an LRU+TTL cache fronting the remote profile
//! service, guarded by a circuit breaker.

pub mod profile_cache;

pub use profile_cache::{HttpProfileFetcher, ProfileCache, ProfileFetcher};
