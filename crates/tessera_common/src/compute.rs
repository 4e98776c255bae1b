//! The contract between the cache and the code that produces values.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::key::CacheKey;

/// A deterministic, per-item computation whose results are cached.
///
/// Implementations must be pure: the same item always yields the same value,
/// in any process, whether run serially by the orchestrator or by a worker.
/// A worker process rebuilds its `Compute` from the [`Descriptor`] the
/// coordination server hands out, so the descriptor must capture every
/// parameter that influences the result.
///
/// [`Descriptor`]: Compute::Descriptor
pub trait Compute {
    /// The input, as shipped to workers.
    type Item: Serialize + DeserializeOwned;
    /// The cached result.
    type Value: Serialize + DeserializeOwned + Clone;
    /// Everything a worker needs to rebuild this computation.
    type Descriptor: Serialize + DeserializeOwned + Clone;

    /// Describes this computation for workers.
    fn descriptor(&self) -> Self::Descriptor;

    /// Computes the value for one item.
    fn compute(&self, item: &Self::Item, key: &CacheKey) -> Self::Value;
}
