//! Fault-tolerance primitives shared by every collaborator that calls an
//! external dependency: circuit breakers (C1) and exponential-backoff
//! retry (used by the Profile Cache, Limit Sync, and Federation egress).

pub mod circuit_breaker;
pub mod retry_backoff;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerManager, CircuitState};
pub use crate::config::CircuitConfig;
pub use retry_backoff::{retry_with_backoff, BackoffPolicy};
