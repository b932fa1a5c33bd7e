use crate::error::Error;
use crate::genome_stats::ImmutableGenomeStats;
use crate::strategy::{
    EvaluationStrategy, GenerationOutcome, RuntimeRanking, StrategyFactory, Workload,
};
use crate::task::{GenomeInstanceTask, Key, RunResult};
use log::debug;

/// Stops evaluating a genome as soon as `winner_count` fully evaluated competitors have a
/// strictly lower penalized runtime than the genome has accumulated so far.
pub struct RacingStrategy<G, I> {
    workload: Workload<G, I>,
    ranking: RuntimeRanking,
    winner_count: usize,
    terminate_with_running_tasks: bool,
}

impl<G: Key, I: Key> RacingStrategy<G, I> {
    pub fn new(
        genomes: &[G],
        instances: &[I],
        ranking: RuntimeRanking,
        winner_count: usize,
        terminate_with_running_tasks: bool,
    ) -> Self {
        Self {
            workload: Workload::new(genomes, instances),
            ranking,
            winner_count: winner_count.max(1),
            terminate_with_running_tasks,
        }
    }

    fn winner_threshold(&self) -> Option<f64> {
        let mut totals: Vec<f64> = self
            .workload
            .all_stats()
            .filter(|stats| stats.is_racing_candidate())
            .map(|stats| self.ranking.total_penalized_secs(stats))
            .collect();

        if totals.len() < self.winner_count {
            return None;
        }

        totals.sort_by(f64::total_cmp);
        Some(totals[self.winner_count - 1])
    }

    fn race(&self) {
        if !self.workload.is_working() {
            return;
        }

        let Some(threshold) = self.winner_threshold() else {
            return;
        };

        for stats in self.workload.all_stats() {
            if !stats.has_open_or_running() {
                continue;
            }

            let lower_bound = self.ranking.total_penalized_secs(stats);
            if lower_bound > threshold && stats.cancel_by_racing() {
                debug!(
                    "Raced out genome {:?}: accumulated {:?} exceeds winner threshold {:?}",
                    stats.genome(),
                    lower_bound,
                    threshold
                );
            }
        }
    }
}

impl<G: Key, I: Key> EvaluationStrategy<G, I> for RacingStrategy<G, I> {
    fn try_pop_task(&mut self) -> Option<GenomeInstanceTask<G, I>> {
        self.workload.pop_open_task()
    }

    fn record_result(&mut self, task: &GenomeInstanceTask<G, I>, result: RunResult) -> bool {
        let applied = self.workload.record(task, result);
        if applied {
            self.race();
        }
        applied
    }

    fn requeue(&mut self, task: GenomeInstanceTask<G, I>) {
        self.workload.requeue(task)
    }

    fn is_generation_finished(&self) -> bool {
        self.workload.is_resolved()
    }

    fn become_working(&mut self) {
        self.workload.become_working();
        self.race();
    }

    fn build_outcome(&self) -> Result<GenerationOutcome<G, I>, Error> {
        self.workload.build_outcome(&self.ranking)
    }

    fn allows_early_termination(&self) -> bool {
        self.terminate_with_running_tasks
    }

    fn genome_stats(&self) -> Vec<ImmutableGenomeStats<G, I>> {
        self.workload.snapshots()
    }
}

pub fn racing<G: Key, I: Key>(
    ranking: RuntimeRanking,
    winner_count: usize,
    terminate_with_running_tasks: bool,
) -> StrategyFactory<G, I> {
    Box::new(
        move |genomes: &[G], instances: &[I]| -> Box<dyn EvaluationStrategy<G, I>> {
            Box::new(RacingStrategy::new(
                genomes,
                instances,
                ranking,
                winner_count,
                terminate_with_running_tasks,
            ))
        },
    )
}
