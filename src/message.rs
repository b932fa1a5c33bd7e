use crate::genome_stats::ImmutableGenomeStats;
use crate::task::{RunResult, WorkerId};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub enum Report<G, I> {
    TaskFinished {
        generation: usize,
        worker: WorkerId,
        genome: G,
        instance: I,
        result: RunResult,
    },
    GenerationFinished {
        generation: usize,
        elapsed: Duration,
        genome_stats: Vec<ImmutableGenomeStats<G, I>>,
    },
    GenerationFailed {
        generation: usize,
        cause: String,
    },
}
