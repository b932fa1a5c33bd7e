use crate::cluster::MemberEvent;
use crate::error::Error;
use crate::storage::StoredResults;
use crate::strategy::{GenerationOutcome, StrategyFactory};
use crate::task::{GenomeInstanceTask, RunResult, WorkerId};
use derivative::Derivative;
use futures::channel::oneshot::Sender;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct GenerationRequest<G, I> {
    pub genomes: Vec<G>,
    pub instances: Vec<I>,
    #[derivative(Debug = "ignore")]
    pub strategy_factory: StrategyFactory<G, I>,
    #[derivative(Debug = "ignore")]
    pub reply: Sender<Result<GenerationOutcome<G, I>, Error>>,
}

#[derive(Debug)]
pub enum CoordinatorEvent<G, I> {
    EvaluateGeneration(GenerationRequest<G, I>),
    StoredResults(StoredResults<G, I>),
    Membership(MemberEvent<G, I>),
    WorkerAccepted {
        worker: WorkerId,
    },
    TaskRejected {
        worker: WorkerId,
        task: GenomeInstanceTask<G, I>,
    },
    TaskCompleted {
        worker: WorkerId,
        task: GenomeInstanceTask<G, I>,
        result: RunResult,
    },
    TaskFailed {
        worker: WorkerId,
        task: GenomeInstanceTask<G, I>,
        cause: Error,
    },
    WorkerFault {
        worker: WorkerId,
        cause: String,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage<G, I> {
    Poll,
    Assign(GenomeInstanceTask<G, I>),
    Stop,
}
