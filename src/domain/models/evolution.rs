//! The Evolution resource: a genetic-algorithm search over gene assignments.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::resource::{impl_resource, ObjectMeta};

/// Value domain of one gene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeneDomain {
    /// Uniform pick from a fixed set.
    Enum { values: Vec<String> },
    /// Uniform in `[min, max]`.
    Numeric { min: f64, max: f64 },
    /// Uniform pick from free-form string options.
    String { options: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneSpec {
    pub name: String,
    #[serde(flatten)]
    pub domain: GeneDomain,
}

/// A concrete gene assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeneValue {
    Number(f64),
    Text(String),
}

impl GeneValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

impl std::fmt::Display for GeneValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// One member of the population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Individual {
    pub id: Uuid,
    pub genes: BTreeMap<String, GeneValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fitness: Option<f64>,
    pub generation: u32,
}

impl Individual {
    pub fn new(genes: BTreeMap<String, GeneValue>, generation: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            genes,
            fitness: None,
            generation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    #[default]
    Tournament,
    Roulette,
    Rank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CrossoverMethod {
    #[default]
    Uniform,
    SinglePoint,
    TwoPoint,
}

fn default_mutation_rate() -> f64 {
    0.1
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MutationSpec {
    pub rate: f64,
}

impl Default for MutationSpec {
    fn default() -> Self {
        Self { rate: default_mutation_rate() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FitnessSpec {
    /// Stop once the best fitness reaches this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Stop after this many identical best-fitness generations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stagnation_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EvolutionBudget {
    pub max_total_cost: f64,
    pub cost_per_eval: f64,
    pub abort_on_over_budget: bool,
}

fn default_population_size() -> usize {
    20
}

fn default_max_generations() -> u32 {
    10
}

fn default_elitism() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionSpec {
    pub genes: Vec<GeneSpec>,
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    #[serde(default = "default_max_generations")]
    pub max_generations: u32,
    #[serde(default)]
    pub fitness: FitnessSpec,
    #[serde(default)]
    pub selection: SelectionMethod,
    #[serde(default)]
    pub crossover: CrossoverMethod,
    #[serde(default)]
    pub mutation: MutationSpec,
    #[serde(default = "default_elitism")]
    pub elitism: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<EvolutionBudget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EvolutionPhase {
    #[default]
    Pending,
    Running,
    Analyzing,
    Completed,
    Failed,
    Aborted,
}

impl EvolutionPhase {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EvolutionStatus {
    pub phase: EvolutionPhase,
    pub generation: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_fitness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_individual: Option<BTreeMap<String, GeneValue>>,
    pub total_cost: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fitness_history: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gene_importance: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The Evolution resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evolution {
    #[serde(default = "super::resource::api_version_default")]
    pub api_version: String,
    #[serde(default = "Evolution::kind_default")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: EvolutionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EvolutionStatus>,
}

impl Evolution {
    fn kind_default() -> String {
        "Evolution".to_string()
    }

    pub fn new(metadata: ObjectMeta, spec: EvolutionSpec) -> Self {
        Self {
            api_version: super::resource::API_VERSION.to_string(),
            kind: Self::kind_default(),
            metadata,
            spec,
            status: None,
        }
    }
}

impl_resource!(Evolution, "Evolution");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gene_spec_flattened_domain() {
        let yaml = r"
name: temperature
type: numeric
min: 0.0
max: 1.0
";
        let gene: GeneSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(gene.name, "temperature");
        assert!(matches!(gene.domain, GeneDomain::Numeric { .. }));
    }

    #[test]
    fn test_gene_value_untagged() {
        let v: GeneValue = serde_json::from_str("0.7").unwrap();
        assert_eq!(v.as_number(), Some(0.7));
        let v: GeneValue = serde_json::from_str("\"high\"").unwrap();
        assert!(matches!(v, GeneValue::Text(_)));
    }
}
