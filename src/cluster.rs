use crate::error::Error;
use crate::event::WorkerMessage;
use crate::task::{NodeAddress, WorkerId};
use async_broadcast::Sender as BroadcastSender;
use derivative::Derivative;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::{select, FutureExt, StreamExt};
use futures_timer::Delay;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

#[derive(Derivative)]
#[derivative(Debug, Clone(bound = ""))]
pub struct WorkerHandle<G, I> {
    pub id: WorkerId,
    #[derivative(Debug = "ignore")]
    sender: UnboundedSender<WorkerMessage<G, I>>,
}

impl<G, I> WorkerHandle<G, I> {
    pub fn new(id: WorkerId, sender: UnboundedSender<WorkerMessage<G, I>>) -> Self {
        Self { id, sender }
    }

    pub fn send(&self, message: WorkerMessage<G, I>) -> bool {
        self.sender.unbounded_send(message).is_ok()
    }
}

#[derive(Derivative)]
#[derivative(Debug, Clone(bound = ""))]
pub enum MemberEvent<G, I> {
    Joined {
        node: NodeAddress,
        workers: Vec<WorkerHandle<G, I>>,
    },
    Unreachable(NodeAddress),
    Departed(NodeAddress),
}

#[derive(Debug)]
pub enum MembershipCommand<G, I> {
    Join {
        node: NodeAddress,
        workers: Vec<WorkerHandle<G, I>>,
    },
    Heartbeat(NodeAddress),
    Leave(NodeAddress),
    Remove(NodeAddress),
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct MembershipSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

struct NodeEntry {
    last_heartbeat: Instant,
    reachable: bool,
}

async fn publish<G, I>(events: &BroadcastSender<MemberEvent<G, I>>, event: MemberEvent<G, I>) {
    if events.broadcast(event).await.is_err() {
        debug!("No subscriber for membership event");
    }
}

pub async fn start_membership<G, I>(
    settings: MembershipSettings,
    mut commands: UnboundedReceiver<MembershipCommand<G, I>>,
    events: BroadcastSender<MemberEvent<G, I>>,
) -> Result<(), Error> {
    let mut nodes: FxHashMap<NodeAddress, NodeEntry> = FxHashMap::default();
    let mut sweep = Delay::new(settings.heartbeat_interval).fuse();

    loop {
        select! {
            command = commands.next() => match command {
                Some(MembershipCommand::Join { node, workers }) => {
                    info!("Node {} joined with {} workers", node, workers.len());
                    nodes.insert(
                        node.clone(),
                        NodeEntry {
                            last_heartbeat: Instant::now(),
                            reachable: true,
                        },
                    );
                    publish(&events, MemberEvent::Joined { node, workers }).await;
                }
                Some(MembershipCommand::Heartbeat(node)) => {
                    if let Some(entry) = nodes.get_mut(&node).filter(|entry| entry.reachable) {
                        entry.last_heartbeat = Instant::now();
                    }
                }
                Some(MembershipCommand::Leave(node)) => {
                    if nodes.remove(&node).is_some() {
                        info!("Node {} left", node);
                        publish(&events, MemberEvent::Departed(node)).await;
                    }
                }
                Some(MembershipCommand::Remove(node)) => {
                    if nodes.remove(&node).is_some() {
                        info!("Removed node {} from membership", node);
                    }
                }
                Some(MembershipCommand::Stop) | None => return Ok(()),
            },
            () = sweep => {
                let now = Instant::now();
                let mut lost = Vec::new();

                for (node, entry) in nodes.iter_mut() {
                    if entry.reachable
                        && now.duration_since(entry.last_heartbeat) > settings.heartbeat_timeout
                    {
                        entry.reachable = false;
                        lost.push(node.clone());
                    }
                }

                for node in lost {
                    warn!(
                        "Node {} missed heartbeats for more than {:?}, marking unreachable",
                        node, settings.heartbeat_timeout
                    );
                    publish(&events, MemberEvent::Unreachable(node)).await;
                }

                sweep = Delay::new(settings.heartbeat_interval).fuse();
            }
        }
    }
}
