use crate::cluster::{start_membership, MembershipCommand, WorkerHandle};
use crate::config::TunerConfig;
use crate::coordinator::{start_coordinator, Coordinator, CoordinatorChannels};
use crate::error::Error;
use crate::event::{CoordinatorEvent, WorkerMessage};
use crate::message::Report;
use crate::storage::{start_result_storage, ResultStorage, StorageMessage};
use crate::strategy::GenerationOutcome;
use crate::target::TargetAlgorithm;
use crate::task::{Key, NodeAddress, WorkerId};
use crate::worker::{start_worker, WorkerSettings};
use futures::channel::mpsc::{self, UnboundedSender};
use futures::channel::oneshot;
use futures::{select, FutureExt, SinkExt};
use futures_timer::Delay;
use log::{error, info};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder;
use tokio::task::JoinHandle;

const MEMBER_EVENT_CAPACITY: usize = 256;

fn agent_failed(join_error: tokio::task::JoinError) -> Error {
    Error::AgentFailed(join_error.to_string())
}

async fn supervise<G: Key, I: Key>(
    worker: WorkerId,
    handle: JoinHandle<Result<(), Error>>,
    mut event_sender: UnboundedSender<CoordinatorEvent<G, I>>,
) {
    let cause = match handle.await {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err.to_string(),
        Err(join_error) => join_error.to_string(),
    };

    error!("Worker {} terminated abnormally: {}", worker, cause);
    event_sender
        .send(CoordinatorEvent::WorkerFault { worker, cause })
        .await
        .ok();
}

fn spawn_worker<G, I, T>(
    id: WorkerId,
    target: Arc<T>,
    settings: WorkerSettings,
    event_sender: UnboundedSender<CoordinatorEvent<G, I>>,
) -> WorkerHandle<G, I>
where
    G: Key,
    I: Key,
    T: TargetAlgorithm<G, I>,
{
    let (sender, inbox) = mpsc::unbounded::<WorkerMessage<G, I>>();
    let handle = tokio::spawn(start_worker(
        id.clone(),
        target,
        settings,
        inbox,
        event_sender.clone(),
    ));
    tokio::spawn(supervise(id.clone(), handle, event_sender));

    WorkerHandle::new(id, sender)
}

async fn send_heartbeats<G, I>(
    node: NodeAddress,
    interval: Duration,
    membership: UnboundedSender<MembershipCommand<G, I>>,
    stopped: oneshot::Receiver<()>,
) {
    let mut stopped = stopped.fuse();

    loop {
        let mut tick = Delay::new(interval).fuse();
        select! {
            _ = stopped => return,
            () = tick => {
                if membership
                    .unbounded_send(MembershipCommand::Heartbeat(node.clone()))
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

struct LocalNode<G, I> {
    workers: Vec<WorkerHandle<G, I>>,
    heartbeat: Option<oneshot::Sender<()>>,
}

impl<G, I> LocalNode<G, I> {
    fn stop_heartbeat(&mut self) {
        if let Some(stop) = self.heartbeat.take() {
            stop.send(()).ok();
        }
    }

    fn stop_workers(&self) {
        for worker in &self.workers {
            worker.send(WorkerMessage::Stop);
        }
    }
}

/// Coordinator, result storage and membership agents plus in-process worker nodes, all running
/// on the current tokio runtime.
pub struct LocalCluster<G, I> {
    config: TunerConfig,
    coordinator: Coordinator<G, I>,
    event_sender: UnboundedSender<CoordinatorEvent<G, I>>,
    membership: UnboundedSender<MembershipCommand<G, I>>,
    storage: UnboundedSender<StorageMessage<G, I>>,
    nodes: FxHashMap<NodeAddress, LocalNode<G, I>>,
    coordinator_task: JoinHandle<Result<(), Error>>,
    membership_task: JoinHandle<Result<(), Error>>,
    storage_task: JoinHandle<ResultStorage<G, I>>,
}

impl<G: Key, I: Key> LocalCluster<G, I> {
    pub fn start(
        config: TunerConfig,
        storage: ResultStorage<G, I>,
        report_sender: Option<UnboundedSender<Report<G, I>>>,
    ) -> Self {
        let (event_sender, event_recv) = mpsc::unbounded();
        let (storage_sender, storage_recv) = mpsc::unbounded();
        let (membership_sender, membership_recv) = mpsc::unbounded();
        let (member_events, member_events_recv) = async_broadcast::broadcast(MEMBER_EVENT_CAPACITY);

        let storage_task = tokio::spawn(start_result_storage(storage, storage_recv));
        let membership_task = tokio::spawn(start_membership(
            config.membership_settings(),
            membership_recv,
            member_events,
        ));
        let coordinator_task = tokio::spawn(start_coordinator(
            config.clone(),
            event_recv,
            member_events_recv,
            CoordinatorChannels {
                storage: storage_sender.clone(),
                membership: membership_sender.clone(),
                report_sender,
            },
        ));

        Self {
            config,
            coordinator: Coordinator::new(event_sender.clone()),
            event_sender,
            membership: membership_sender,
            storage: storage_sender,
            nodes: FxHashMap::default(),
            coordinator_task,
            membership_task,
            storage_task,
        }
    }

    pub fn coordinator(&self) -> Coordinator<G, I> {
        self.coordinator.clone()
    }

    pub fn add_node<T: TargetAlgorithm<G, I>>(&mut self, node: NodeAddress, target: Arc<T>) {
        let settings = self.config.worker_settings();
        let workers: Vec<WorkerHandle<G, I>> = (0..self.config.workers_per_node)
            .map(|index| {
                spawn_worker(
                    WorkerId::new(node.clone(), index),
                    target.clone(),
                    settings,
                    self.event_sender.clone(),
                )
            })
            .collect();

        let (stop, stopped) = oneshot::channel();
        tokio::spawn(send_heartbeats(
            node.clone(),
            self.config.heartbeat_interval,
            self.membership.clone(),
            stopped,
        ));

        self.membership
            .unbounded_send(MembershipCommand::Join {
                node: node.clone(),
                workers: workers.clone(),
            })
            .ok();

        if let Some(mut previous) = self.nodes.insert(
            node,
            LocalNode {
                workers,
                heartbeat: Some(stop),
            },
        ) {
            previous.stop_heartbeat();
            previous.stop_workers();
        }
    }

    /// Silences the node's heartbeats while its workers keep running, as a network partition
    /// would.
    pub fn partition_node(&mut self, node: &NodeAddress) {
        if let Some(local) = self.nodes.get_mut(node) {
            info!("Partitioning node {}", node);
            local.stop_heartbeat();
        }
    }

    pub fn stop_node(&mut self, node: &NodeAddress) {
        if let Some(mut local) = self.nodes.remove(node) {
            info!("Stopping node {}", node);
            local.stop_heartbeat();
            self.membership
                .unbounded_send(MembershipCommand::Leave(node.clone()))
                .ok();
            local.stop_workers();
        }
    }

    pub async fn shutdown(mut self) -> Result<ResultStorage<G, I>, Error> {
        self.coordinator.shutdown();
        self.coordinator_task.await.map_err(agent_failed)??;

        for (_, mut local) in self.nodes.drain() {
            local.stop_heartbeat();
            local.stop_workers();
        }

        self.membership.unbounded_send(MembershipCommand::Stop).ok();
        self.membership_task.await.map_err(agent_failed)??;

        self.storage.unbounded_send(StorageMessage::Stop).ok();
        self.storage_task.await.map_err(agent_failed)
    }
}

#[allow(clippy::too_many_arguments)]
pub fn run_local_generation<G, I, T>(
    config: TunerConfig,
    target: T,
    num_nodes: usize,
    genomes: Vec<G>,
    instances: Vec<I>,
    storage: ResultStorage<G, I>,
    report_sender: Option<UnboundedSender<Report<G, I>>>,
    terminate_on_signal: bool,
) -> Result<(GenerationOutcome<G, I>, ResultStorage<G, I>), Error>
where
    G: Key,
    I: Key,
    T: TargetAlgorithm<G, I>,
{
    let runtime = Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(async move {
        let mut cluster = LocalCluster::start(config.clone(), storage, report_sender);
        let target = Arc::new(target);

        for index in 0..num_nodes.max(1) {
            cluster.add_node(NodeAddress::new(format!("local:{}", index)), target.clone());
        }

        let coordinator = cluster.coordinator();
        if terminate_on_signal {
            let coordinator = coordinator.clone();
            ctrlc::set_handler(move || {
                info!("Received signal, shutting down");
                coordinator.shutdown();
            })?;
        }

        let outcome = coordinator
            .evaluate_generation(genomes, instances, config.strategy_factory())
            .await;
        let storage = cluster.shutdown().await?;

        Ok::<_, Error>((outcome?, storage))
    })
}
