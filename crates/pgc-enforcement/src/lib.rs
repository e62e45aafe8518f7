//! PGC Enforcement
//!
//! The request-facing half of the compiler:
//!
//! - [`coordinator`]: one context in, one decision out
//! - [`batch`]: parallel or sequential evaluation of many contexts
//! - [`cache`]: fingerprint-keyed decision cache with TTL and LRU eviction
//! - [`penalty`]: heuristics that annotate decisions with a governance penalty

pub mod batch;
pub mod cache;
pub mod coordinator;
pub mod penalty;

pub use batch::{BatchConfig, BatchResponse, BatchStrategy, BatchSummary};
pub use cache::{CacheConfig, CacheStats, EnforcementCache};
pub use coordinator::{CoordinatorConfig, DecisionCoordinator};
pub use penalty::{PenaltyBreakdown, PenaltyConfig, PenaltyScorer, DEFAULT_UNSAFE_PATTERNS};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchResponse, BatchStrategy};
    pub use crate::cache::{CacheConfig, EnforcementCache};
    pub use crate::coordinator::{CoordinatorConfig, DecisionCoordinator};
    pub use crate::penalty::{PenaltyConfig, PenaltyScorer};
}
