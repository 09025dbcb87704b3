//! Evolution controller.
//!
//! Drives a genetic-algorithm search over gene assignments: random
//! initialization, fitness evaluation through the `FitnessEvaluator` port,
//! selection/crossover/mutation into the next generation, stopping
//! conditions, and a final eta-squared gene-importance analysis.
//!
//! The population is process-local state. If the controller restarts while
//! a resource is Running, the next reconcile jumps straight to Analyzing
//! with whatever the status still carries.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::domain::errors::{EvolutionError, ReconcileError};
use crate::domain::models::{
    CrossoverMethod, Evolution, EvolutionPhase, EvolutionStatus, GeneDomain, GeneSpec, GeneValue,
    Individual, Resource, SelectionMethod,
};
use crate::domain::ports::{FitnessEvaluator, ResourceStore};
use crate::services::reconciler::Reconcile;

/// Numeric mutation nudges by at most this fraction of the gene's range.
const NUMERIC_MUTATION_SPAN: f64 = 0.1;

struct Population {
    individuals: Vec<Individual>,
    generation: u32,
}

pub struct EvolutionController {
    evolutions: Arc<dyn ResourceStore<Evolution>>,
    evaluator: Arc<dyn FitnessEvaluator>,
    populations: Mutex<HashMap<String, Population>>,
}

impl EvolutionController {
    pub fn new(evolutions: Arc<dyn ResourceStore<Evolution>>, evaluator: Arc<dyn FitnessEvaluator>) -> Self {
        Self {
            evolutions,
            evaluator,
            populations: Mutex::new(HashMap::new()),
        }
    }

    async fn write_status(&self, evolution: &Evolution, status: EvolutionStatus) -> Result<(), ReconcileError> {
        let mut updated = evolution.clone();
        updated.status = Some(status);
        self.evolutions
            .set_status(updated)
            .await
            .map_err(ReconcileError::transient)?;
        Ok(())
    }

    fn take_population(&self, key: &str) -> Option<Population> {
        self.populations.lock().ok()?.remove(key)
    }

    fn store_population(&self, key: String, population: Population) {
        if let Ok(mut populations) = self.populations.lock() {
            populations.insert(key, population);
        }
    }

    // -------------------------------------------------------------------------
    // Pending: build the initial population
    // -------------------------------------------------------------------------

    async fn reconcile_pending(&self, evolution: &Evolution, mut status: EvolutionStatus) -> Result<(), ReconcileError> {
        let spec = &evolution.spec;

        if let Some(budget) = &spec.budget {
            #[allow(clippy::cast_precision_loss)]
            let estimate =
                spec.population_size as f64 * f64::from(spec.max_generations) * budget.cost_per_eval;
            if budget.abort_on_over_budget && estimate > budget.max_total_cost {
                tracing::warn!(evolution = %evolution.metadata.name, estimate, "evolution aborted before start");
                status.phase = EvolutionPhase::Failed;
                status.message = Some(format!(
                    "estimated cost {estimate:.4} exceeds budget {:.4}",
                    budget.max_total_cost
                ));
                return self.write_status(evolution, status).await;
            }
        }

        // ThreadRng must not cross an await point; scope it tightly.
        let individuals = {
            let mut rng = rand::thread_rng();
            let built: Result<Vec<Individual>, EvolutionError> = (0..spec.population_size)
                .map(|_| Ok(Individual::new(random_genes(&spec.genes, &mut rng)?, 0)))
                .collect();
            built.map_err(ReconcileError::terminal)?
        };

        self.store_population(evolution.key(), Population { individuals, generation: 0 });

        status.phase = EvolutionPhase::Running;
        status.generation = 0;
        tracing::info!(
            evolution = %evolution.metadata.name,
            population = spec.population_size,
            "population initialized"
        );
        self.write_status(evolution, status).await
    }

    // -------------------------------------------------------------------------
    // Running: one generation per reconcile
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    async fn reconcile_running(&self, evolution: &Evolution, mut status: EvolutionStatus) -> Result<(), ReconcileError> {
        let spec = &evolution.spec;
        let key = evolution.key();

        let Some(mut population) = self.take_population(&key) else {
            // Controller restarted: the in-memory population is gone.
            tracing::warn!(evolution = %evolution.metadata.name, "population lost; analyzing from status");
            status.phase = EvolutionPhase::Analyzing;
            status.message = Some("population lost on restart".to_string());
            return self.write_status(evolution, status).await;
        };

        // 1. Evaluate unfitted individuals.
        let cost_per_eval = spec.budget.as_ref().map_or(0.0, |b| b.cost_per_eval);
        for individual in &mut population.individuals {
            if individual.fitness.is_some() {
                continue;
            }
            let fitness = self
                .evaluator
                .evaluate(individual)
                .await
                .map_err(ReconcileError::terminal)?;
            individual.fitness = Some(fitness);
            status.total_cost += cost_per_eval;
        }

        // 3. Track the best individual.
        let best = population
            .individuals
            .iter()
            .max_by(|a, b| {
                a.fitness
                    .unwrap_or(f64::NEG_INFINITY)
                    .total_cmp(&b.fitness.unwrap_or(f64::NEG_INFINITY))
            })
            .cloned();
        if let Some(best) = &best {
            status.best_fitness = best.fitness;
            status.best_individual = Some(best.genes.clone());
        }

        // 4. Record the generation's best fitness.
        if let Some(best_fitness) = status.best_fitness {
            status.fitness_history.push(best_fitness);
        }

        // 2 & 5. Stopping conditions.
        let budget_cap = spec.budget.map(|b| b.max_total_cost).filter(|cap| *cap > 0.0);
        let over_budget = budget_cap.is_some_and(|cap| status.total_cost >= cap);
        let generations_done = population.generation >= spec.max_generations;
        let threshold_met = match (spec.fitness.threshold, status.best_fitness) {
            (Some(threshold), Some(best)) => best >= threshold,
            _ => false,
        };
        let stagnated = spec.fitness.stagnation_limit.is_some_and(|limit| {
            limit > 0
                && status.fitness_history.len() >= limit
                && status.fitness_history[status.fitness_history.len() - limit..]
                    .windows(2)
                    .all(|w| (w[0] - w[1]).abs() < f64::EPSILON)
        });

        if over_budget || generations_done || threshold_met || stagnated {
            let reason = if over_budget {
                "budget limit reached"
            } else if threshold_met {
                "fitness threshold reached"
            } else if stagnated {
                "fitness stagnated"
            } else {
                "generation limit reached"
            };
            tracing::info!(evolution = %evolution.metadata.name, reason, "evolution stopping");
            // Keep the population for the analysis pass.
            self.store_population(key, population);
            status.phase = EvolutionPhase::Analyzing;
            status.message = Some(reason.to_string());
            return self.write_status(evolution, status).await;
        }

        // 7. Breed the next generation (RNG scoped away from await points).
        let next = {
            let mut rng = rand::thread_rng();
            next_generation(&population.individuals, spec, population.generation + 1, &mut rng)
                .map_err(ReconcileError::terminal)?
        };

        population.generation += 1;
        status.generation = population.generation;
        population.individuals = next;
        self.store_population(key, population);

        self.write_status(evolution, status).await
    }

    // -------------------------------------------------------------------------
    // Analyzing: eta-squared gene importance
    // -------------------------------------------------------------------------

    async fn reconcile_analyzing(&self, evolution: &Evolution, mut status: EvolutionStatus) -> Result<(), ReconcileError> {
        let population = self.take_population(&evolution.key());

        let importance = population.as_ref().map(|population| {
            evolution
                .spec
                .genes
                .iter()
                .map(|gene| (gene.name.clone(), eta_squared(&population.individuals, &gene.name)))
                .collect::<BTreeMap<String, f64>>()
        });

        status.gene_importance = importance;
        status.phase = EvolutionPhase::Completed;
        tracing::info!(
            evolution = %evolution.metadata.name,
            best = ?status.best_fitness,
            "evolution completed"
        );
        self.write_status(evolution, status).await
    }
}

#[async_trait]
impl Reconcile<Evolution> for EvolutionController {
    async fn reconcile(&self, evolution: Evolution) -> Result<(), ReconcileError> {
        let status = evolution.status.clone().unwrap_or_default();

        match status.phase {
            EvolutionPhase::Completed | EvolutionPhase::Failed | EvolutionPhase::Aborted => Ok(()),
            EvolutionPhase::Pending => self.reconcile_pending(&evolution, status).await,
            EvolutionPhase::Running => self.reconcile_running(&evolution, status).await,
            EvolutionPhase::Analyzing => self.reconcile_analyzing(&evolution, status).await,
        }
    }

    async fn cleanup(&self, evolution: Evolution) {
        if let Ok(mut populations) = self.populations.lock() {
            populations.remove(&evolution.key());
        }
    }

    async fn on_terminal_failure(&self, evolution: Evolution, error: &ReconcileError) {
        let mut status = evolution.status.clone().unwrap_or_default();
        if status.phase.is_terminal() {
            return;
        }
        status.phase = EvolutionPhase::Failed;
        status.message = Some(format!("reconcile failed: {error}"));
        let mut updated = evolution.clone();
        updated.status = Some(status);
        if let Err(err) = self.evolutions.set_status(updated).await {
            tracing::error!(evolution = %evolution.key(), error = %err, "failed to record terminal failure");
        }
    }
}

// ============================================================================
// Genetic operators
// ============================================================================

/// Draw a random assignment for every gene.
pub fn random_genes<R: Rng>(
    genes: &[GeneSpec],
    rng: &mut R,
) -> Result<BTreeMap<String, GeneValue>, EvolutionError> {
    let mut assignment = BTreeMap::new();
    for gene in genes {
        let value = match &gene.domain {
            GeneDomain::Enum { values } => GeneValue::Text(
                values
                    .choose(rng)
                    .ok_or_else(|| EvolutionError::EmptyGene(gene.name.clone()))?
                    .clone(),
            ),
            GeneDomain::Numeric { min, max } => GeneValue::Number(rng.gen_range(*min..=*max)),
            GeneDomain::String { options } => GeneValue::Text(
                options
                    .choose(rng)
                    .ok_or_else(|| EvolutionError::EmptyGene(gene.name.clone()))?
                    .clone(),
            ),
        };
        assignment.insert(gene.name.clone(), value);
    }
    Ok(assignment)
}

/// Pick one parent from a population sorted best-first.
pub fn select<'a, R: Rng>(
    sorted: &'a [Individual],
    method: SelectionMethod,
    rng: &mut R,
) -> Result<&'a Individual, EvolutionError> {
    if sorted.is_empty() {
        return Err(EvolutionError::EmptyPopulation);
    }

    let fitness_of = |i: &Individual| i.fitness.unwrap_or(0.0);

    match method {
        SelectionMethod::Tournament => {
            let a = &sorted[rng.gen_range(0..sorted.len())];
            let b = &sorted[rng.gen_range(0..sorted.len())];
            Ok(if fitness_of(a) >= fitness_of(b) { a } else { b })
        }
        SelectionMethod::Roulette => {
            // Shift so every weight is positive.
            let min = sorted.iter().map(|i| fitness_of(i)).fold(f64::INFINITY, f64::min);
            let offset = if min < 0.0 { -min } else { 0.0 } + 1e-9;
            let total: f64 = sorted.iter().map(|i| fitness_of(i) + offset).sum();
            let mut spin = rng.gen_range(0.0..total);
            for individual in sorted {
                spin -= fitness_of(individual) + offset;
                if spin <= 0.0 {
                    return Ok(individual);
                }
            }
            Ok(&sorted[sorted.len() - 1])
        }
        SelectionMethod::Rank => {
            // Best-first ordering: rank N for the best, 1 for the worst.
            let n = sorted.len();
            let total = n * (n + 1) / 2;
            let mut spin = rng.gen_range(0..total);
            for (index, individual) in sorted.iter().enumerate() {
                let rank = n - index;
                if spin < rank {
                    return Ok(individual);
                }
                spin -= rank;
            }
            Ok(&sorted[n - 1])
        }
    }
}

/// Combine two parents into a child gene assignment.
pub fn crossover<R: Rng>(
    parent1: &Individual,
    parent2: &Individual,
    method: CrossoverMethod,
    rng: &mut R,
) -> BTreeMap<String, GeneValue> {
    let names: Vec<&String> = parent1.genes.keys().collect();
    let n = names.len();
    let mut child = BTreeMap::new();

    let take_from_parent2: Box<dyn Fn(usize, &mut R) -> bool> = match method {
        CrossoverMethod::Uniform => Box::new(|_, rng: &mut R| rng.gen_bool(0.5)),
        CrossoverMethod::SinglePoint => {
            let cut = if n == 0 { 0 } else { rng.gen_range(0..=n) };
            Box::new(move |index, _| index >= cut)
        }
        CrossoverMethod::TwoPoint => {
            let (a, b) = if n == 0 {
                (0, 0)
            } else {
                let x = rng.gen_range(0..=n);
                let y = rng.gen_range(0..=n);
                (x.min(y), x.max(y))
            };
            Box::new(move |index, _| index >= a && index < b)
        }
    };

    for (index, name) in names.iter().enumerate() {
        let source = if take_from_parent2(index, rng) { parent2 } else { parent1 };
        let value = source
            .genes
            .get(*name)
            .or_else(|| parent1.genes.get(*name))
            .cloned();
        if let Some(value) = value {
            child.insert((*name).clone(), value);
        }
    }
    child
}

/// Mutate one gene value in place of the current assignment.
pub fn mutate_gene<R: Rng>(gene: &GeneSpec, current: &GeneValue, rng: &mut R) -> GeneValue {
    match &gene.domain {
        GeneDomain::Enum { values } | GeneDomain::String { options: values } => {
            let others: Vec<&String> = values
                .iter()
                .filter(|v| match current {
                    GeneValue::Text(text) => *v != text,
                    GeneValue::Number(_) => true,
                })
                .collect();
            others.choose(rng).map_or_else(
                || current.clone(),
                |picked| GeneValue::Text((*picked).clone()),
            )
        }
        GeneDomain::Numeric { min, max } => {
            let range = max - min;
            let base = current.as_number().unwrap_or(*min);
            let nudge = rng.gen_range(-NUMERIC_MUTATION_SPAN..=NUMERIC_MUTATION_SPAN) * range;
            GeneValue::Number((base + nudge).clamp(*min, *max))
        }
    }
}

/// Breed the next generation: elites first, then select → crossover → mutate.
pub fn next_generation<R: Rng>(
    current: &[Individual],
    spec: &crate::domain::models::EvolutionSpec,
    generation: u32,
    rng: &mut R,
) -> Result<Vec<Individual>, EvolutionError> {
    if current.is_empty() {
        return Err(EvolutionError::EmptyPopulation);
    }

    let mut sorted: Vec<Individual> = current.to_vec();
    sorted.sort_by(|a, b| {
        b.fitness
            .unwrap_or(f64::NEG_INFINITY)
            .total_cmp(&a.fitness.unwrap_or(f64::NEG_INFINITY))
    });

    let mut next = Vec::with_capacity(spec.population_size);

    // Elites carry over unchanged (fitness retained; no re-evaluation).
    for elite in sorted.iter().take(spec.elitism.min(sorted.len())) {
        let mut copy = elite.clone();
        copy.generation = generation;
        next.push(copy);
    }

    while next.len() < spec.population_size {
        let parent1 = select(&sorted, spec.selection, rng)?;
        let parent2 = select(&sorted, spec.selection, rng)?;
        let mut genes = crossover(parent1, parent2, spec.crossover, rng);

        for gene in &spec.genes {
            if rng.gen_bool(spec.mutation.rate.clamp(0.0, 1.0)) {
                if let Some(current_value) = genes.get(&gene.name) {
                    let mutated = mutate_gene(gene, current_value, rng);
                    genes.insert(gene.name.clone(), mutated);
                }
            }
        }

        next.push(Individual::new(genes, generation));
    }

    Ok(next)
}

/// Eta-squared: the share of fitness variance explained by one gene.
///
/// Individuals are grouped by the gene's value; between-group sum of squares
/// over total sum of squares. Zero when fitness does not vary.
pub fn eta_squared(individuals: &[Individual], gene_name: &str) -> f64 {
    let scored: Vec<(&GeneValue, f64)> = individuals
        .iter()
        .filter_map(|i| i.genes.get(gene_name).map(|g| (g, i.fitness.unwrap_or(0.0))))
        .collect();
    if scored.is_empty() {
        return 0.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let n = scored.len() as f64;
    let grand_mean: f64 = scored.iter().map(|(_, f)| f).sum::<f64>() / n;

    let ss_total: f64 = scored.iter().map(|(_, f)| (f - grand_mean).powi(2)).sum();
    if ss_total == 0.0 {
        return 0.0;
    }

    let mut groups: HashMap<String, Vec<f64>> = HashMap::new();
    for (value, fitness) in &scored {
        groups.entry(value.to_string()).or_default().push(*fitness);
    }

    let ss_between: f64 = groups
        .values()
        .map(|group| {
            #[allow(clippy::cast_precision_loss)]
            let count = group.len() as f64;
            let mean = group.iter().sum::<f64>() / count;
            count * (mean - grand_mean).powi(2)
        })
        .sum();

    ss_between / ss_total
}
