use crate::task::{GenomeInstanceTask, Key, RunResult};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use log::{debug, trace};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone)]
pub struct StoredResults<G, I> {
    pub generation: usize,
    pub genome: G,
    pub results: FxHashMap<I, RunResult>,
}

#[derive(Debug)]
pub enum StorageMessage<G, I> {
    Request {
        generation: usize,
        genome: G,
        reply: UnboundedSender<StoredResults<G, I>>,
    },
    Record {
        task: GenomeInstanceTask<G, I>,
        result: RunResult,
    },
    Stop,
}

#[derive(Debug, Clone)]
pub struct ResultStorage<G, I> {
    results: FxHashMap<G, FxHashMap<I, RunResult>>,
}

impl<G, I> Default for ResultStorage<G, I> {
    fn default() -> Self {
        Self {
            results: FxHashMap::default(),
        }
    }
}

impl<G: Key, I: Key> ResultStorage<G, I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: GenomeInstanceTask<G, I>, result: RunResult) {
        self.results
            .entry(task.genome)
            .or_default()
            .insert(task.instance, result);
    }

    pub fn results_for(&self, genome: &G) -> FxHashMap<I, RunResult> {
        self.results.get(genome).cloned().unwrap_or_default()
    }

    pub fn get(&self, task: &GenomeInstanceTask<G, I>) -> Option<&RunResult> {
        self.results
            .get(&task.genome)
            .and_then(|results| results.get(&task.instance))
    }

    pub fn len(&self) -> usize {
        self.results.values().map(FxHashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub async fn start_result_storage<G: Key, I: Key>(
    mut storage: ResultStorage<G, I>,
    mut recv: UnboundedReceiver<StorageMessage<G, I>>,
) -> ResultStorage<G, I> {
    while let Some(message) = recv.next().await {
        match message {
            StorageMessage::Request {
                generation,
                genome,
                reply,
            } => {
                let results = storage.results_for(&genome);
                trace!(
                    "Answering storage request for {:?} with {} results",
                    genome,
                    results.len()
                );
                reply
                    .unbounded_send(StoredResults {
                        generation,
                        genome,
                        results,
                    })
                    .ok();
            }
            StorageMessage::Record { task, result } => storage.insert(task, result),
            StorageMessage::Stop => break,
        }
    }

    debug!("Result storage stopped with {} results", storage.len());
    storage
}
