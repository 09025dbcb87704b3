//! FitnessEvaluator port - scores evolution individuals.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::domain::errors::EvolutionError;
use crate::domain::models::Individual;

/// Scores an individual's gene assignment. Higher is better.
#[async_trait]
pub trait FitnessEvaluator: Send + Sync {
    async fn evaluate(&self, individual: &Individual) -> Result<f64, EvolutionError>;
}

/// Deterministic evaluator hashing the gene assignment into `[0, 1)`.
///
/// Stands in until a formation-and-mission-backed evaluator exists; being a
/// pure function of the genes it keeps evolution runs reproducible.
pub struct GeneHashEvaluator;

#[async_trait]
impl FitnessEvaluator for GeneHashEvaluator {
    async fn evaluate(&self, individual: &Individual) -> Result<f64, EvolutionError> {
        let mut hasher = DefaultHasher::new();
        for (name, value) in &individual.genes {
            name.hash(&mut hasher);
            value.to_string().hash(&mut hasher);
        }
        #[allow(clippy::cast_precision_loss)]
        let fitness = (hasher.finish() % 10_000) as f64 / 10_000.0;
        Ok(fitness)
    }
}
