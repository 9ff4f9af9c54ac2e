//! Memory-estimator collaborator
//!
//! An optional pre-flight gate on pulls: the estimator reports whether the
//! host has enough RAM/VRAM headroom for a model. Estimation failures never
//! block a pull; availability is preferred over false negatives.

use crate::error::Result;
use async_trait::async_trait;

/// Outcome of a memory estimation for one model.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCheck {
    pub proceed: bool,
    pub required: u64,
    pub available: u64,
}

#[async_trait]
pub trait MemoryEstimator: Send + Sync {
    /// Estimate whether the referenced model fits in the available memory.
    async fn have_sufficient_memory(&self, reference: &str) -> Result<MemoryCheck>;
}

/// Estimator that always proceeds, for hosts without an estimation
/// collaborator.
pub struct NoopMemoryEstimator;

#[async_trait]
impl MemoryEstimator for NoopMemoryEstimator {
    async fn have_sufficient_memory(&self, _reference: &str) -> Result<MemoryCheck> {
        Ok(MemoryCheck {
            proceed: true,
            required: 0,
            available: 0,
        })
    }
}
