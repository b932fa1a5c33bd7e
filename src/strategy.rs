use crate::error::Error;
use crate::genome_stats::{GenomeStats, ImmutableGenomeStats};
use crate::task::{GenomeInstanceTask, Key, RunResult, RunStatus};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tangram_finite::FiniteF64;

pub trait EvaluationStrategy<G, I>: Send {
    fn try_pop_task(&mut self) -> Option<GenomeInstanceTask<G, I>>;

    fn record_result(&mut self, task: &GenomeInstanceTask<G, I>, result: RunResult) -> bool;

    fn requeue(&mut self, task: GenomeInstanceTask<G, I>);

    /// Monotone: once true, stays true for this strategy.
    fn is_generation_finished(&self) -> bool;

    fn become_working(&mut self);

    fn build_outcome(&self) -> Result<GenerationOutcome<G, I>, Error>;

    fn allows_early_termination(&self) -> bool {
        false
    }

    fn genome_stats(&self) -> Vec<ImmutableGenomeStats<G, I>>;
}

pub type StrategyFactory<G, I> =
    Box<dyn FnOnce(&[G], &[I]) -> Box<dyn EvaluationStrategy<G, I>> + Send>;

/// Penalized average runtime (PAR-k): runs that did not complete count `penalization_factor`
/// times their recorded runtime. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRanking {
    pub penalization_factor: f64,
}

impl Default for RuntimeRanking {
    fn default() -> Self {
        Self {
            penalization_factor: 10.0,
        }
    }
}

impl RuntimeRanking {
    pub fn new(penalization_factor: f64) -> Self {
        Self {
            penalization_factor,
        }
    }

    /// Penalized runtime in seconds. Saturates to infinity instead of overflowing.
    pub fn penalized_secs(&self, result: &RunResult) -> f64 {
        let secs = result.runtime.as_secs_f64();
        match result.status {
            RunStatus::Completed => secs,
            RunStatus::Cancelled | RunStatus::Faulted => secs * self.penalization_factor,
        }
    }

    /// Sum of penalized runtimes over finished instances. For a genome with unfinished work this
    /// is a lower bound of its final total.
    pub fn total_penalized_secs<G: Key, I: Key>(&self, stats: &GenomeStats<G, I>) -> f64 {
        stats.fold_finished(0.0, |acc, result| acc + self.penalized_secs(result))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedGenome<G, I> {
    pub genome: G,
    pub score: f64,
    pub raced: bool,
    pub results: Vec<(I, RunResult)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome<G, I> {
    pub ranking: Vec<RankedGenome<G, I>>,
}

impl<G, I> GenerationOutcome<G, I> {
    pub fn best(&self) -> Option<&RankedGenome<G, I>> {
        self.ranking.first()
    }

    pub fn result_count(&self) -> usize {
        self.ranking.iter().map(|ranked| ranked.results.len()).sum()
    }
}

#[derive(Ord, Eq, PartialEq, PartialOrd, Clone, Debug)]
struct RankingKey {
    raced: bool,
    score: FiniteF64,
    index: usize,
}

fn finitify_score<G: Key>(genome: &G, score: f64) -> Result<FiniteF64, Error> {
    FiniteF64::new(score).map_err(|_| Error::NonFiniteScore {
        genome: format!("{:?}", genome),
    })
}

pub struct Workload<G, I> {
    genomes: Vec<G>,
    stats: FxHashMap<G, GenomeStats<G, I>>,
    open_tasks: VecDeque<GenomeInstanceTask<G, I>>,
    queued: FxHashSet<GenomeInstanceTask<G, I>>,
    working: bool,
}

impl<G: Key, I: Key> Workload<G, I> {
    pub fn new(genomes: &[G], instances: &[I]) -> Self {
        let mut ordered = Vec::with_capacity(genomes.len());
        let mut stats = FxHashMap::default();

        for genome in genomes {
            if !stats.contains_key(genome) {
                ordered.push(genome.clone());
                stats.insert(
                    genome.clone(),
                    GenomeStats::new(genome.clone(), instances.iter().cloned()),
                );
            }
        }

        Self {
            genomes: ordered,
            stats,
            open_tasks: VecDeque::new(),
            queued: FxHashSet::default(),
            working: false,
        }
    }

    pub fn stats(&self, genome: &G) -> Option<&GenomeStats<G, I>> {
        self.stats.get(genome)
    }

    pub fn all_stats(&self) -> impl Iterator<Item = &GenomeStats<G, I>> {
        self.genomes.iter().filter_map(|genome| self.stats.get(genome))
    }

    pub fn is_working(&self) -> bool {
        self.working
    }

    pub fn become_working(&mut self) {
        self.working = true;
    }

    /// Pops queued tasks until one can be started. Tasks whose instance is no longer open
    /// (finished, raced out or already running) are dropped from the queue.
    pub fn pop_open_task(&mut self) -> Option<GenomeInstanceTask<G, I>> {
        while let Some(task) = self.open_tasks.pop_front() {
            self.queued.remove(&task);
            let started = self
                .stats
                .get(&task.genome)
                .map(|stats| stats.start_instance(&task.instance))
                .unwrap_or(false);

            if started {
                return Some(task);
            }
        }

        None
    }

    pub fn record(&mut self, task: &GenomeInstanceTask<G, I>, result: RunResult) -> bool {
        match self.stats.get(&task.genome) {
            Some(stats) => {
                if !self.working {
                    stats.start_instance(&task.instance);
                }
                stats.finish_instance(&task.instance, result)
            }
            None => false,
        }
    }

    pub fn requeue(&mut self, task: GenomeInstanceTask<G, I>) {
        let Some(stats) = self.stats.get(&task.genome) else {
            return;
        };

        stats.requeue_instance(&task.instance);

        if stats.is_open(&task.instance) && !self.queued.contains(&task) {
            self.queued.insert(task.clone());
            self.open_tasks.push_back(task);
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.stats.values().all(|stats| !stats.has_open_or_running())
    }

    pub fn snapshots(&self) -> Vec<ImmutableGenomeStats<G, I>> {
        self.all_stats().map(GenomeStats::freeze).collect()
    }

    pub fn build_outcome(
        &self,
        ranking: &RuntimeRanking,
    ) -> Result<GenerationOutcome<G, I>, Error> {
        let mut ranked = Vec::with_capacity(self.genomes.len());

        for (index, stats) in self.all_stats().enumerate() {
            let frozen = stats.freeze();
            let total: f64 = frozen
                .finished
                .iter()
                .map(|(_, result)| ranking.penalized_secs(result))
                .sum();
            let score = if frozen.finished.is_empty() {
                0.0
            } else {
                total / frozen.finished.len() as f64
            };

            let key = RankingKey {
                raced: frozen.raced,
                score: finitify_score(&frozen.genome, score)?,
                index,
            };

            ranked.push((
                key,
                RankedGenome {
                    genome: frozen.genome,
                    score,
                    raced: frozen.raced,
                    results: frozen.finished,
                },
            ));
        }

        ranked.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

        Ok(GenerationOutcome {
            ranking: ranked.into_iter().map(|(_, ranked)| ranked).collect(),
        })
    }
}

pub struct FullEvaluationStrategy<G, I> {
    workload: Workload<G, I>,
    ranking: RuntimeRanking,
}

impl<G: Key, I: Key> FullEvaluationStrategy<G, I> {
    pub fn new(genomes: &[G], instances: &[I], ranking: RuntimeRanking) -> Self {
        Self {
            workload: Workload::new(genomes, instances),
            ranking,
        }
    }
}

impl<G: Key, I: Key> EvaluationStrategy<G, I> for FullEvaluationStrategy<G, I> {
    fn try_pop_task(&mut self) -> Option<GenomeInstanceTask<G, I>> {
        self.workload.pop_open_task()
    }

    fn record_result(&mut self, task: &GenomeInstanceTask<G, I>, result: RunResult) -> bool {
        self.workload.record(task, result)
    }

    fn requeue(&mut self, task: GenomeInstanceTask<G, I>) {
        self.workload.requeue(task)
    }

    fn is_generation_finished(&self) -> bool {
        self.workload.is_resolved()
    }

    fn become_working(&mut self) {
        self.workload.become_working()
    }

    fn build_outcome(&self) -> Result<GenerationOutcome<G, I>, Error> {
        self.workload.build_outcome(&self.ranking)
    }

    fn genome_stats(&self) -> Vec<ImmutableGenomeStats<G, I>> {
        self.workload.snapshots()
    }
}

pub fn full_evaluation<G: Key, I: Key>(ranking: RuntimeRanking) -> StrategyFactory<G, I> {
    Box::new(
        move |genomes: &[G], instances: &[I]| -> Box<dyn EvaluationStrategy<G, I>> {
            Box::new(FullEvaluationStrategy::new(genomes, instances, ranking))
        },
    )
}
