use crate::cluster::{MemberEvent, MembershipCommand, WorkerHandle};
use crate::config::TunerConfig;
use crate::error::Error;
use crate::event::{CoordinatorEvent, GenerationRequest, WorkerMessage};
use crate::message::Report;
use crate::storage::{StorageMessage, StoredResults};
use crate::strategy::{EvaluationStrategy, GenerationOutcome, StrategyFactory};
use crate::task::{GenomeInstanceTask, Key, NodeAddress, RunResult, RunStatus, WorkerId};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::{future, pin_mut, stream, Stream, StreamExt};
use itertools::Itertools;
use log::{debug, error, info, trace, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Instant;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WaitingForWorkers,
    Ready,
    FetchingResultsFromStorage,
    Working,
}

pub struct Coordinator<G, I> {
    events: UnboundedSender<CoordinatorEvent<G, I>>,
}

impl<G, I> Clone for Coordinator<G, I> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<G: Key, I: Key> Coordinator<G, I> {
    pub fn new(events: UnboundedSender<CoordinatorEvent<G, I>>) -> Self {
        Self { events }
    }

    pub async fn evaluate_generation(
        &self,
        genomes: Vec<G>,
        instances: Vec<I>,
        strategy_factory: StrategyFactory<G, I>,
    ) -> Result<GenerationOutcome<G, I>, Error> {
        let (reply, outcome) = oneshot::channel();

        self.events
            .unbounded_send(CoordinatorEvent::EvaluateGeneration(GenerationRequest {
                genomes,
                instances,
                strategy_factory,
                reply,
            }))
            .map_err(|_| Error::CoordinatorStopped)?;

        outcome.await.map_err(|_| Error::CoordinatorStopped)?
    }

    pub fn shutdown(&self) {
        self.events.unbounded_send(CoordinatorEvent::Shutdown).ok();
    }
}

struct ActiveGeneration<G, I> {
    index: usize,
    instances: Vec<I>,
    strategy: Box<dyn EvaluationStrategy<G, I>>,
    pending_genomes: FxHashSet<G>,
    reply: oneshot::Sender<Result<GenerationOutcome<G, I>, Error>>,
    started: Instant,
}

pub struct CoordinatorChannels<G, I> {
    pub storage: UnboundedSender<StorageMessage<G, I>>,
    pub membership: UnboundedSender<MembershipCommand<G, I>>,
    pub report_sender: Option<UnboundedSender<Report<G, I>>>,
}

struct Context<G, I> {
    config: TunerConfig,
    phase: Phase,
    workers: FxHashMap<WorkerId, WorkerHandle<G, I>>,
    assignments: FxHashMap<WorkerId, GenomeInstanceTask<G, I>>,
    queued: VecDeque<GenerationRequest<G, I>>,
    active: Option<ActiveGeneration<G, I>>,
    generation_count: usize,
    stored_results_sender: UnboundedSender<StoredResults<G, I>>,
    channels: CoordinatorChannels<G, I>,
}

impl<G: Key, I: Key> Context<G, I> {
    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("Coordinator phase: {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn report(&self, report: Report<G, I>) {
        if let Some(sender) = &self.channels.report_sender {
            sender.unbounded_send(report).ok();
        }
    }

    fn on_generation_request(&mut self, request: GenerationRequest<G, I>) -> Result<(), Error> {
        if self.phase == Phase::WaitingForWorkers || self.active.is_some() {
            debug!(
                "Queueing generation request ({} already queued) in phase {}",
                self.queued.len(),
                self.phase
            );
            self.queued.push_back(request);
            Ok(())
        } else {
            self.start_generation(request)
        }
    }

    fn release_queued(&mut self) -> Result<(), Error> {
        while self.phase == Phase::Ready && self.active.is_none() {
            match self.queued.pop_front() {
                Some(request) => self.start_generation(request)?,
                None => break,
            }
        }
        Ok(())
    }

    fn start_generation(&mut self, request: GenerationRequest<G, I>) -> Result<(), Error> {
        let genomes: Vec<G> = request.genomes.into_iter().unique().collect();
        let instances: Vec<I> = request.instances.into_iter().unique().collect();

        if genomes.is_empty() || instances.is_empty() {
            warn!("Rejecting empty generation");
            request.reply.send(Err(Error::EmptyGeneration)).ok();
            return Ok(());
        }

        let index = self.generation_count;
        self.generation_count += 1;

        info!(
            "Starting generation {}: {} genomes x {} instances",
            index,
            genomes.len(),
            instances.len()
        );

        let strategy = (request.strategy_factory)(&genomes, &instances);

        self.active = Some(ActiveGeneration {
            index,
            instances,
            strategy,
            pending_genomes: genomes.iter().cloned().collect(),
            reply: request.reply,
            started: Instant::now(),
        });
        self.set_phase(Phase::FetchingResultsFromStorage);

        for genome in genomes {
            self.channels
                .storage
                .unbounded_send(StorageMessage::Request {
                    generation: index,
                    genome,
                    reply: self.stored_results_sender.clone(),
                })
                .map_err(|_| Error::StorageUnavailable)?;
        }

        Ok(())
    }

    fn on_stored_results(&mut self, stored: StoredResults<G, I>) -> Result<(), Error> {
        let Some(active) = self.active.as_mut() else {
            trace!("Ignoring stored results without active generation");
            return Ok(());
        };

        if self.phase != Phase::FetchingResultsFromStorage
            || stored.generation != active.index
            || !active.pending_genomes.remove(&stored.genome)
        {
            trace!("Ignoring stale stored results for {:?}", stored.genome);
            return Ok(());
        }

        for instance in &active.instances {
            let task = GenomeInstanceTask::new(stored.genome.clone(), instance.clone());
            match stored.results.get(instance) {
                Some(result) => {
                    active.strategy.record_result(&task, *result);
                }
                None => active.strategy.requeue(task),
            }
        }

        if !active.pending_genomes.is_empty() {
            return Ok(());
        }

        active.strategy.become_working();
        info!("Generation {}: all cached results fetched", active.index);

        if active.strategy.is_generation_finished() {
            info!(
                "Generation {} finished from cached results alone",
                active.index
            );
            return self.complete_generation();
        }

        self.set_phase(Phase::Working);
        self.poll_all();
        Ok(())
    }

    fn poll_all(&self) {
        for handle in self.workers.values() {
            if !self.assignments.contains_key(&handle.id) {
                handle.send(WorkerMessage::Poll);
            }
        }
    }

    fn poll(&self, worker: &WorkerId) {
        if let Some(handle) = self.workers.get(worker) {
            handle.send(WorkerMessage::Poll);
        }
    }

    fn on_worker_accepted(&mut self, worker: WorkerId) {
        if self.phase != Phase::Working || self.assignments.contains_key(&worker) {
            return;
        }

        let (Some(active), Some(handle)) = (self.active.as_mut(), self.workers.get(&worker)) else {
            return;
        };

        if active.strategy.is_generation_finished() {
            return;
        }

        let Some(task) = active.strategy.try_pop_task() else {
            return;
        };

        // Popping moves the instance to running, so an assigned task is never popped again.
        debug_assert!(
            !self.assignments.values().any(|assigned| *assigned == task),
            "{:?} popped while assigned",
            task
        );

        if !handle.send(WorkerMessage::Assign(task.clone())) {
            warn!("Worker {} is gone, requeueing {:?}", worker, task);
            active.strategy.requeue(task);
            return;
        }

        trace!("Assigned {:?} to {}", task, worker);
        self.assignments.insert(worker, task);
    }

    fn on_task_rejected(&mut self, worker: WorkerId, task: GenomeInstanceTask<G, I>) {
        if self.assignments.get(&worker) != Some(&task) {
            return;
        }

        self.assignments.remove(&worker);
        if let Some(active) = self.active.as_mut() {
            debug!("Worker {} rejected {:?}, requeueing", worker, task);
            active.strategy.requeue(task);
        }
        self.poll_all();
    }

    fn on_task_completed(
        &mut self,
        worker: WorkerId,
        task: GenomeInstanceTask<G, I>,
        result: RunResult,
    ) -> Result<(), Error> {
        if self.assignments.get(&worker) != Some(&task) {
            warn!(
                "Discarding stale result of {:?} from {}: not its current assignment",
                task, worker
            );
            if self.phase == Phase::Working && !self.assignments.contains_key(&worker) {
                self.poll(&worker);
            }
            return Ok(());
        }

        self.assignments.remove(&worker);

        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let generation = active.index;
        let applied = active.strategy.record_result(&task, result);

        trace!(
            "Result {:?} for {:?} from {} (applied: {})",
            result,
            task,
            worker,
            applied
        );

        if result.status != RunStatus::Faulted {
            self.channels
                .storage
                .unbounded_send(StorageMessage::Record {
                    task: task.clone(),
                    result,
                })
                .map_err(|_| Error::StorageUnavailable)?;
        }

        if applied {
            self.report(Report::TaskFinished {
                generation,
                worker: worker.clone(),
                genome: task.genome,
                instance: task.instance,
                result,
            });
        }

        if self.check_generation_finished()? {
            return Ok(());
        }

        if self.phase == Phase::Working {
            self.poll(&worker);
        }
        Ok(())
    }

    fn on_task_failed(
        &mut self,
        worker: WorkerId,
        task: GenomeInstanceTask<G, I>,
        cause: Error,
    ) -> Result<(), Error> {
        if self.assignments.get(&worker) == Some(&task) {
            error!("Task {:?} failed on {}: {}", task, worker, cause);
        }

        self.on_task_completed(worker, task, RunResult::faulted(self.config.cpu_timeout))
    }

    /// Reports completion once the strategy is finished and no assigned task is outstanding,
    /// or right away if the strategy allows early termination. Returns whether it completed.
    fn check_generation_finished(&mut self) -> Result<bool, Error> {
        let Some(active) = self.active.as_ref() else {
            return Ok(false);
        };

        if self.phase != Phase::Working || !active.strategy.is_generation_finished() {
            return Ok(false);
        }

        if !self.assignments.is_empty() && !active.strategy.allows_early_termination() {
            debug!(
                "Generation {} finished, waiting for {} tasks in flight",
                active.index,
                self.assignments.len()
            );
            return Ok(false);
        }

        self.complete_generation()?;
        Ok(true)
    }

    fn complete_generation(&mut self) -> Result<(), Error> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        if !self.assignments.is_empty() {
            info!(
                "Generation {} terminated early, discarding {} tasks in flight",
                active.index,
                self.assignments.len()
            );
            self.assignments.clear();
        }

        self.set_phase(Phase::Ready);

        match active.strategy.build_outcome() {
            Ok(outcome) => {
                let elapsed = active.started.elapsed();
                info!(
                    "Generation {} finished after {:?}, best: {:?}",
                    active.index,
                    elapsed,
                    outcome.best().map(|ranked| &ranked.genome)
                );
                self.report(Report::GenerationFinished {
                    generation: active.index,
                    elapsed,
                    genome_stats: active.strategy.genome_stats(),
                });
                active.reply.send(Ok(outcome)).ok();
            }
            Err(err) => {
                error!("Generation {} failed: {}", active.index, err);
                self.report(Report::GenerationFailed {
                    generation: active.index,
                    cause: err.to_string(),
                });
                active.reply.send(Err(err)).ok();
            }
        }

        self.after_generation()
    }

    fn fail_generation(&mut self, err: Error) -> Result<(), Error> {
        self.assignments.clear();

        match self.active.take() {
            Some(active) => {
                error!("Generation {} failed: {}", active.index, err);
                self.report(Report::GenerationFailed {
                    generation: active.index,
                    cause: err.to_string(),
                });
                active.reply.send(Err(err)).ok();
            }
            None => error!("Coordinator fault outside of a generation: {}", err),
        }

        if self.phase != Phase::WaitingForWorkers {
            self.set_phase(Phase::Ready);
        }

        self.after_generation()
    }

    fn after_generation(&mut self) -> Result<(), Error> {
        if self.workers.is_empty() {
            self.set_phase(Phase::WaitingForWorkers);
        }
        self.release_queued()
    }

    fn on_member_event(&mut self, event: MemberEvent<G, I>) -> Result<(), Error> {
        match event {
            MemberEvent::Joined { node, workers } => self.on_workers_joined(node, workers),
            MemberEvent::Unreachable(node) => self.on_node_lost(node, true),
            MemberEvent::Departed(node) => self.on_node_lost(node, false),
        }
    }

    fn on_workers_joined(
        &mut self,
        node: NodeAddress,
        workers: Vec<WorkerHandle<G, I>>,
    ) -> Result<(), Error> {
        info!("{} workers joined from {}", workers.len(), node);

        for handle in workers {
            if self.phase == Phase::Working {
                handle.send(WorkerMessage::Poll);
            }
            self.workers.insert(handle.id.clone(), handle);
        }

        if self.phase == Phase::WaitingForWorkers && !self.workers.is_empty() {
            self.set_phase(Phase::Ready);
            return self.release_queued();
        }
        Ok(())
    }

    /// Requeues the node's assignments and forgets its workers. Repeated events for the same
    /// node find nothing left to do.
    fn on_node_lost(&mut self, node: NodeAddress, unreachable: bool) -> Result<(), Error> {
        let lost_workers: Vec<WorkerId> = self
            .workers
            .keys()
            .filter(|worker| worker.node == node)
            .cloned()
            .collect();
        let lost_assignments: Vec<WorkerId> = self
            .assignments
            .keys()
            .filter(|worker| worker.node == node)
            .cloned()
            .collect();

        if lost_workers.is_empty() && lost_assignments.is_empty() {
            return Ok(());
        }

        warn!(
            "Lost node {} ({} workers, {} tasks in flight)",
            node,
            lost_workers.len(),
            lost_assignments.len()
        );

        for worker in lost_assignments {
            if let Some(task) = self.assignments.remove(&worker) {
                if let Some(active) = self.active.as_mut() {
                    debug!("Requeueing {:?} held by lost worker {}", task, worker);
                    active.strategy.requeue(task);
                }
            }
        }

        for worker in lost_workers {
            self.workers.remove(&worker);
        }

        if unreachable {
            self.channels
                .membership
                .unbounded_send(MembershipCommand::Remove(node))
                .ok();
        }

        if self.workers.is_empty() && self.phase == Phase::Ready {
            self.set_phase(Phase::WaitingForWorkers);
        }

        if self.check_generation_finished()? {
            return Ok(());
        }

        if self.phase == Phase::Working {
            self.poll_all();
        }
        Ok(())
    }

    fn on_worker_fault(&mut self, worker: WorkerId, cause: String) -> Result<(), Error> {
        error!("Worker {} faulted: {}", worker, cause);
        self.workers.remove(&worker);
        let held_task = self.assignments.remove(&worker);

        if self.active.is_some() {
            return self.fail_generation(Error::WorkerFault {
                worker: worker.to_string(),
                cause,
            });
        }

        if held_task.is_some() {
            warn!("Faulted worker {} held a task outside of a generation", worker);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        info!("Coordinator shutting down");

        for handle in self.workers.values() {
            handle.send(WorkerMessage::Stop);
        }
        self.workers.clear();
        self.assignments.clear();

        if let Some(active) = self.active.take() {
            active.reply.send(Err(Error::CoordinatorStopped)).ok();
        }
        for request in self.queued.drain(..) {
            request.reply.send(Err(Error::CoordinatorStopped)).ok();
        }
    }

    fn handle(&mut self, event: CoordinatorEvent<G, I>) -> Result<(), Error> {
        match event {
            CoordinatorEvent::EvaluateGeneration(request) => self.on_generation_request(request),
            CoordinatorEvent::StoredResults(stored) => self.on_stored_results(stored),
            CoordinatorEvent::Membership(event) => self.on_member_event(event),
            CoordinatorEvent::WorkerAccepted { worker } => {
                self.on_worker_accepted(worker);
                Ok(())
            }
            CoordinatorEvent::TaskRejected { worker, task } => {
                self.on_task_rejected(worker, task);
                Ok(())
            }
            CoordinatorEvent::TaskCompleted {
                worker,
                task,
                result,
            } => self.on_task_completed(worker, task, result),
            CoordinatorEvent::TaskFailed {
                worker,
                task,
                cause,
            } => self.on_task_failed(worker, task, cause),
            CoordinatorEvent::WorkerFault { worker, cause } => self.on_worker_fault(worker, cause),
            CoordinatorEvent::Shutdown => Ok(()),
        }
    }
}

pub async fn start_coordinator<G, I, M>(
    config: TunerConfig,
    events: UnboundedReceiver<CoordinatorEvent<G, I>>,
    member_events: M,
    channels: CoordinatorChannels<G, I>,
) -> Result<(), Error>
where
    G: Key,
    I: Key,
    M: Stream<Item = MemberEvent<G, I>>,
{
    let (stored_results_sender, stored_results) = futures::channel::mpsc::unbounded();

    let mut ctx = Context {
        config,
        phase: Phase::WaitingForWorkers,
        workers: FxHashMap::default(),
        assignments: FxHashMap::default(),
        queued: VecDeque::new(),
        active: None,
        generation_count: 0,
        stored_results_sender,
        channels,
    };

    let events = events.chain(stream::once(future::ready(CoordinatorEvent::Shutdown)));
    let events = stream::select(
        stream::select(events, stored_results.map(CoordinatorEvent::StoredResults)),
        member_events.map(CoordinatorEvent::Membership),
    );
    pin_mut!(events);

    while let Some(event) = events.next().await {
        if matches!(event, CoordinatorEvent::Shutdown) {
            break;
        }

        if let Err(err) = ctx.handle(event) {
            if let Err(err) = ctx.fail_generation(err) {
                error!("Unable to recover from coordinator fault: {}", err);
            }
        }
    }

    ctx.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunerConfigBuilder;
    use crate::storage::{start_result_storage, ResultStorage};
    use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    type Task = GenomeInstanceTask<u32, u32>;

    fn worker_id(node: &str, index: usize) -> WorkerId {
        WorkerId::new(NodeAddress::new(node), index)
    }

    fn runtime_by_genome(task: &Task) -> Duration {
        Duration::from_millis(task.genome as u64 * 10)
    }

    async fn recv<T>(receiver: &mut UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), receiver.next())
            .await
            .unwrap()
            .unwrap()
    }

    fn manual_worker(
        node: &str,
        index: usize,
    ) -> (WorkerHandle<u32, u32>, UnboundedReceiver<WorkerMessage<u32, u32>>) {
        let (sender, inbox) = mpsc::unbounded();
        (WorkerHandle::new(worker_id(node, index), sender), inbox)
    }

    struct Harness {
        events: UnboundedSender<CoordinatorEvent<u32, u32>>,
        member_events: UnboundedSender<MemberEvent<u32, u32>>,
        membership: UnboundedReceiver<MembershipCommand<u32, u32>>,
        storage: UnboundedSender<StorageMessage<u32, u32>>,
        storage_task: JoinHandle<ResultStorage<u32, u32>>,
        coordinator_task: JoinHandle<Result<(), Error>>,
        dispatched: Arc<Mutex<Vec<Task>>>,
        config: TunerConfig,
    }

    impl Harness {
        fn start(config: TunerConfig, storage: ResultStorage<u32, u32>) -> Self {
            let (events, event_recv) = mpsc::unbounded();
            let (member_events, member_event_recv) = mpsc::unbounded();
            let (membership_sender, membership) = mpsc::unbounded();
            let (storage_sender, storage_recv) = mpsc::unbounded();

            let storage_task = tokio::spawn(start_result_storage(storage, storage_recv));
            let coordinator_task = tokio::spawn(start_coordinator(
                config.clone(),
                event_recv,
                member_event_recv,
                CoordinatorChannels {
                    storage: storage_sender.clone(),
                    membership: membership_sender,
                    report_sender: None,
                },
            ));

            Self {
                events,
                member_events,
                membership,
                storage: storage_sender,
                storage_task,
                coordinator_task,
                dispatched: Arc::default(),
                config,
            }
        }

        fn send(&self, event: CoordinatorEvent<u32, u32>) {
            self.events.unbounded_send(event).unwrap();
        }

        fn member_event(&self, event: MemberEvent<u32, u32>) {
            self.member_events.unbounded_send(event).unwrap();
        }

        fn join(&self, node: &str, workers: Vec<WorkerHandle<u32, u32>>) {
            self.member_event(MemberEvent::Joined {
                node: NodeAddress::new(node),
                workers,
            });
        }

        /// A worker that accepts every poll and completes every task right away.
        fn serving_worker(&self, node: &str, index: usize) -> WorkerHandle<u32, u32> {
            let (handle, mut inbox) = manual_worker(node, index);
            let worker = handle.id.clone();
            let events = self.events.clone();
            let dispatched = self.dispatched.clone();

            tokio::spawn(async move {
                while let Some(message) = inbox.next().await {
                    let event = match message {
                        WorkerMessage::Poll => CoordinatorEvent::WorkerAccepted {
                            worker: worker.clone(),
                        },
                        WorkerMessage::Assign(task) => {
                            dispatched.lock().unwrap().push(task.clone());
                            let result = RunResult::completed(runtime_by_genome(&task));
                            CoordinatorEvent::TaskCompleted {
                                worker: worker.clone(),
                                task,
                                result,
                            }
                        }
                        WorkerMessage::Stop => return,
                    };
                    if events.unbounded_send(event).is_err() {
                        return;
                    }
                }
            });

            handle
        }

        fn evaluate(
            &self,
            genomes: Vec<u32>,
            instances: Vec<u32>,
        ) -> JoinHandle<Result<GenerationOutcome<u32, u32>, Error>> {
            let coordinator = Coordinator::new(self.events.clone());
            let strategy_factory = self.config.strategy_factory();
            tokio::spawn(async move {
                coordinator
                    .evaluate_generation(genomes, instances, strategy_factory)
                    .await
            })
        }

        async fn accept_next(
            &self,
            worker: &WorkerId,
            inbox: &mut UnboundedReceiver<WorkerMessage<u32, u32>>,
        ) -> Task {
            assert_eq!(recv(inbox).await, WorkerMessage::Poll);
            self.send(CoordinatorEvent::WorkerAccepted {
                worker: worker.clone(),
            });
            match recv(inbox).await {
                WorkerMessage::Assign(task) => task,
                other => panic!("expected an assignment, got {:?}", other),
            }
        }

        fn complete(&self, worker: &WorkerId, task: Task) {
            let result = RunResult::completed(runtime_by_genome(&task));
            self.send(CoordinatorEvent::TaskCompleted {
                worker: worker.clone(),
                task,
                result,
            });
        }

        fn dispatched(&self) -> Vec<Task> {
            self.dispatched.lock().unwrap().clone()
        }

        async fn stop(self) -> ResultStorage<u32, u32> {
            Coordinator::new(self.events.clone()).shutdown();
            self.coordinator_task.await.unwrap().unwrap();
            self.storage.unbounded_send(StorageMessage::Stop).unwrap();
            self.storage_task.await.unwrap()
        }
    }

    fn full_evaluation_config() -> TunerConfig {
        TunerConfigBuilder::new().build().unwrap()
    }

    #[tokio::test]
    async fn generation_waits_for_workers() {
        let harness = Harness::start(full_evaluation_config(), ResultStorage::new());

        let outcome = harness.evaluate(vec![2, 1], vec![10, 20]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!outcome.is_finished());
        assert!(harness.dispatched().is_empty());

        harness.join("n1", vec![harness.serving_worker("n1", 0)]);
        let outcome = outcome.await.unwrap().unwrap();

        assert_eq!(outcome.result_count(), 4);
        assert_eq!(outcome.ranking[0].genome, 1);
        assert_eq!(outcome.ranking[1].genome, 2);
        assert_eq!(harness.dispatched().len(), 4);

        let storage = harness.stop().await;
        assert_eq!(storage.len(), 4);
    }

    #[tokio::test]
    async fn cached_results_short_circuit_dispatch() {
        let mut storage = ResultStorage::new();
        for (genome, secs) in [(1, 1), (2, 2)] {
            for instance in [10, 20] {
                storage.insert(
                    GenomeInstanceTask::new(genome, instance),
                    RunResult::completed(Duration::from_secs(secs)),
                );
            }
        }

        let harness = Harness::start(full_evaluation_config(), storage);
        let (worker, mut inbox) = manual_worker("n1", 0);
        harness.join("n1", vec![worker]);

        let outcome = harness.evaluate(vec![1, 2], vec![10, 20]).await.unwrap().unwrap();

        assert_eq!(outcome.result_count(), 4);
        assert_eq!(outcome.ranking[0].genome, 1);
        assert!(inbox.try_next().is_err());

        harness.stop().await;
    }

    #[tokio::test]
    async fn duplicates_are_evaluated_once() {
        let harness = Harness::start(full_evaluation_config(), ResultStorage::new());
        harness.join("n1", vec![harness.serving_worker("n1", 0)]);

        let outcome = harness
            .evaluate(vec![1, 1, 1], vec![10, 10])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.ranking.len(), 1);
        assert_eq!(harness.dispatched(), vec![GenomeInstanceTask::new(1, 10)]);

        harness.stop().await;
    }

    #[tokio::test]
    async fn empty_generation_is_rejected() {
        let harness = Harness::start(full_evaluation_config(), ResultStorage::new());
        let (worker, _inbox) = manual_worker("n1", 0);
        harness.join("n1", vec![worker]);

        let outcome = harness.evaluate(vec![], vec![10]).await.unwrap();

        assert!(matches!(outcome, Err(Error::EmptyGeneration)));
        harness.stop().await;
    }

    #[tokio::test]
    async fn lost_node_work_is_reassigned() {
        let mut harness = Harness::start(full_evaluation_config(), ResultStorage::new());
        let (worker_a, mut inbox_a) = manual_worker("a", 0);
        harness.join("a", vec![worker_a]);

        let outcome = harness.evaluate(vec![1], vec![10, 20]);

        assert_eq!(recv(&mut inbox_a).await, WorkerMessage::Poll);
        harness.send(CoordinatorEvent::WorkerAccepted {
            worker: worker_id("a", 0),
        });
        let WorkerMessage::Assign(held) = recv(&mut inbox_a).await else {
            panic!("expected an assignment");
        };

        harness.join("b", vec![harness.serving_worker("b", 0)]);
        harness.member_event(MemberEvent::Unreachable(NodeAddress::new("a")));

        let outcome = outcome.await.unwrap().unwrap();
        assert_eq!(outcome.result_count(), 2);
        assert!(harness.dispatched().contains(&held));
        assert!(matches!(
            recv(&mut harness.membership).await,
            MembershipCommand::Remove(node) if node == NodeAddress::new("a")
        ));

        harness.send(CoordinatorEvent::TaskCompleted {
            worker: worker_id("a", 0),
            task: held.clone(),
            result: RunResult::completed(Duration::from_secs(99)),
        });

        let storage = harness.stop().await;
        assert_eq!(
            storage.get(&held),
            Some(&RunResult::completed(runtime_by_genome(&held)))
        );
    }

    #[tokio::test]
    async fn worker_fault_fails_generation_only() {
        let harness = Harness::start(full_evaluation_config(), ResultStorage::new());
        let (worker, mut inbox) = manual_worker("a", 0);
        harness.join("a", vec![worker]);

        let outcome = harness.evaluate(vec![1], vec![10]);
        assert_eq!(recv(&mut inbox).await, WorkerMessage::Poll);
        harness.send(CoordinatorEvent::WorkerAccepted {
            worker: worker_id("a", 0),
        });
        assert!(matches!(recv(&mut inbox).await, WorkerMessage::Assign(_)));

        harness.send(CoordinatorEvent::WorkerFault {
            worker: worker_id("a", 0),
            cause: "panicked".to_string(),
        });
        assert!(matches!(
            outcome.await.unwrap(),
            Err(Error::WorkerFault { .. })
        ));

        harness.join("b", vec![harness.serving_worker("b", 0)]);
        let outcome = harness.evaluate(vec![1], vec![10]).await.unwrap().unwrap();
        assert_eq!(outcome.result_count(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn failed_task_is_recorded_as_faulted() {
        let harness = Harness::start(full_evaluation_config(), ResultStorage::new());
        let (worker, mut inbox) = manual_worker("a", 0);
        harness.join("a", vec![worker]);

        let outcome = harness.evaluate(vec![1], vec![10]);
        assert_eq!(recv(&mut inbox).await, WorkerMessage::Poll);
        harness.send(CoordinatorEvent::WorkerAccepted {
            worker: worker_id("a", 0),
        });
        let WorkerMessage::Assign(task) = recv(&mut inbox).await else {
            panic!("expected an assignment");
        };
        harness.send(CoordinatorEvent::TaskFailed {
            worker: worker_id("a", 0),
            task,
            cause: Error::TargetFault("crashed".to_string()),
        });

        let outcome = outcome.await.unwrap().unwrap();
        let (_, result) = &outcome.ranking[0].results[0];
        assert_eq!(result.status, RunStatus::Faulted);

        let storage = harness.stop().await;
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn racing_skips_hopeless_genomes() {
        let config = TunerConfigBuilder::new().racing(1).build().unwrap();
        let harness = Harness::start(config, ResultStorage::new());
        harness.join("n1", vec![harness.serving_worker("n1", 0)]);

        let outcome = harness
            .evaluate(vec![1, 9], vec![10, 20, 30, 40])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.ranking[0].genome, 1);
        assert!(!outcome.ranking[0].raced);
        assert!(outcome.ranking[1].raced);
        assert!(harness.dispatched().len() < 8);

        harness.stop().await;
    }

    #[tokio::test]
    async fn shutdown_fails_pending_requests() {
        let harness = Harness::start(full_evaluation_config(), ResultStorage::new());
        let outcome = harness.evaluate(vec![1], vec![10]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        harness.stop().await;

        assert!(matches!(
            outcome.await.unwrap(),
            Err(Error::CoordinatorStopped)
        ));
    }

    /// Two manual workers: genome 1 finishes first, then genome 9 is raced out while worker b
    /// still runs its second instance. Returns the pending outcome and b's in-flight task.
    async fn race_with_task_in_flight(
        harness: &Harness,
    ) -> (
        JoinHandle<Result<GenerationOutcome<u32, u32>, Error>>,
        Task,
    ) {
        let (a, b) = (worker_id("a", 0), worker_id("b", 0));
        let (handle_a, mut inbox_a) = manual_worker("a", 0);
        let (handle_b, mut inbox_b) = manual_worker("b", 0);
        harness.join("a", vec![handle_a]);
        harness.join("b", vec![handle_b]);

        let outcome = harness.evaluate(vec![1, 9], vec![10, 20]);

        let first_a = harness.accept_next(&a, &mut inbox_a).await;
        let first_b = harness.accept_next(&b, &mut inbox_b).await;
        assert_eq!(first_a.genome, 1);
        assert_eq!(first_b.genome, 1);

        harness.complete(&a, first_a);
        let second_a = harness.accept_next(&a, &mut inbox_a).await;
        harness.complete(&b, first_b);
        let second_b = harness.accept_next(&b, &mut inbox_b).await;
        assert_eq!(second_a.genome, 9);
        assert_eq!(second_b.genome, 9);

        harness.complete(&a, second_a);
        (outcome, second_b)
    }

    #[tokio::test]
    async fn early_termination_reports_without_waiting() {
        let config = TunerConfigBuilder::new()
            .racing(1)
            .terminate_with_running_tasks(true)
            .build()
            .unwrap();
        let harness = Harness::start(config, ResultStorage::new());

        let (outcome, in_flight) = race_with_task_in_flight(&harness).await;
        let outcome = outcome.await.unwrap().unwrap();
        assert_eq!(outcome.ranking[0].genome, 1);
        assert!(outcome.ranking[1].raced);

        harness.complete(&worker_id("b", 0), in_flight.clone());

        let storage = harness.stop().await;
        assert_eq!(storage.len(), 3);
        assert!(storage.get(&in_flight).is_none());
    }

    #[tokio::test]
    async fn finished_generation_waits_for_running_tasks() {
        let config = TunerConfigBuilder::new().racing(1).build().unwrap();
        let harness = Harness::start(config, ResultStorage::new());

        let (outcome, in_flight) = race_with_task_in_flight(&harness).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!outcome.is_finished());

        harness.complete(&worker_id("b", 0), in_flight);
        let outcome = outcome.await.unwrap().unwrap();
        assert!(outcome.ranking[1].raced);

        let storage = harness.stop().await;
        assert_eq!(storage.len(), 4);
    }

    #[tokio::test]
    async fn rejected_task_is_offered_again() {
        let harness = Harness::start(full_evaluation_config(), ResultStorage::new());
        let worker = worker_id("a", 0);
        let (handle, mut inbox) = manual_worker("a", 0);
        harness.join("a", vec![handle]);

        let outcome = harness.evaluate(vec![1], vec![10]);

        let task = harness.accept_next(&worker, &mut inbox).await;
        harness.send(CoordinatorEvent::TaskRejected {
            worker: worker.clone(),
            task: task.clone(),
        });

        let offered_again = harness.accept_next(&worker, &mut inbox).await;
        assert_eq!(offered_again, task);
        harness.complete(&worker, offered_again);

        let outcome = outcome.await.unwrap().unwrap();
        assert_eq!(outcome.result_count(), 1);
        harness.stop().await;
    }

    #[tokio::test]
    async fn every_task_is_dispatched_once() {
        let harness = Harness::start(full_evaluation_config(), ResultStorage::new());
        let workers = (0..3)
            .map(|index| harness.serving_worker("n1", index))
            .collect();
        harness.join("n1", workers);

        let outcome = harness
            .evaluate(vec![1, 2, 3, 4], vec![10, 20, 30, 40, 50])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.result_count(), 20);

        let dispatched = harness.dispatched();
        let unique: FxHashSet<&Task> = dispatched.iter().collect();
        assert_eq!(dispatched.len(), 20);
        assert_eq!(unique.len(), 20);

        harness.stop().await;
    }
}
