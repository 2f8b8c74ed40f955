//! Connectors: interior chainables that schedule their children.

pub mod circuit_breaker;
pub mod concurrent;
pub mod fallback;
pub mod handle;
pub mod race;
pub mod rate_limiter;
pub mod retry;
pub mod sequence;
pub mod switch;
pub mod timeout;
pub mod worker_pool;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use concurrent::{Concurrent, Scaffold};
pub use fallback::Fallback;
pub use handle::Handle;
pub use race::{Contest, Race};
pub use rate_limiter::{LimiterMode, RateLimiter};
pub use retry::{Backoff, Retry};
pub use sequence::Sequence;
pub use switch::{Filter, Switch};
pub use timeout::Timeout;
pub use worker_pool::{PoolMode, WorkerPool};
