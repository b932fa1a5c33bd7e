use crate::task::{Key, RunResult};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Buckets<I> {
    open: FxHashSet<I>,
    running: FxHashSet<I>,
    finished: FxHashMap<I, RunResult>,
    cancelled_by_racing: FxHashSet<I>,
    raced: bool,
}

impl<I: Key> Buckets<I> {
    fn has_open_or_running(&self) -> bool {
        !self.open.is_empty() || !self.running.is_empty()
    }

    fn len(&self) -> usize {
        self.open.len() + self.running.len() + self.finished.len() + self.cancelled_by_racing.len()
    }
}

pub struct GenomeStats<G, I> {
    genome: G,
    total_instance_count: usize,
    buckets: Mutex<Buckets<I>>,
}

impl<G: Key, I: Key> GenomeStats<G, I> {
    pub fn new<T>(genome: G, instances: T) -> Self
    where
        T: IntoIterator<Item = I>,
    {
        let open: FxHashSet<I> = instances.into_iter().collect();

        Self {
            genome,
            total_instance_count: open.len(),
            buckets: Mutex::new(Buckets {
                open,
                running: FxHashSet::default(),
                finished: FxHashMap::default(),
                cancelled_by_racing: FxHashSet::default(),
                raced: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets<I>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn genome(&self) -> &G {
        &self.genome
    }

    pub fn total_instance_count(&self) -> usize {
        self.total_instance_count
    }

    /// Open -> Running. Returns false without changes if the instance is not open.
    pub fn start_instance(&self, instance: &I) -> bool {
        let mut buckets = self.lock();
        if buckets.open.remove(instance) {
            buckets.running.insert(instance.clone());
            true
        } else {
            false
        }
    }

    /// Running -> Finished. Rejected if the instance is not running or already finished.
    pub fn finish_instance(&self, instance: &I, result: RunResult) -> bool {
        let mut buckets = self.lock();
        if buckets.finished.contains_key(instance) || !buckets.running.remove(instance) {
            return false;
        }

        buckets.finished.insert(instance.clone(), result);
        true
    }

    /// Running -> Open. Rejected if the instance is finished or not running.
    pub fn requeue_instance(&self, instance: &I) -> bool {
        let mut buckets = self.lock();
        if buckets.finished.contains_key(instance) || !buckets.running.remove(instance) {
            return false;
        }

        buckets.open.insert(instance.clone());
        true
    }

    /// Moves every open and running instance to the cancelled bucket. Only has an effect while
    /// the genome still has open or running work, so a second call returns false.
    pub fn cancel_by_racing(&self) -> bool {
        let mut buckets = self.lock();
        if !buckets.has_open_or_running() {
            return false;
        }

        let open = std::mem::take(&mut buckets.open);
        let running = std::mem::take(&mut buckets.running);
        buckets.cancelled_by_racing.extend(open);
        buckets.cancelled_by_racing.extend(running);
        buckets.raced = true;

        debug_assert_eq!(buckets.len(), self.total_instance_count);
        true
    }

    pub fn is_open(&self, instance: &I) -> bool {
        self.lock().open.contains(instance)
    }

    pub fn is_running(&self, instance: &I) -> bool {
        self.lock().running.contains(instance)
    }

    pub fn has_open_or_running(&self) -> bool {
        self.lock().has_open_or_running()
    }

    pub fn is_raced(&self) -> bool {
        self.lock().raced
    }

    /// A genome may be used to race out competitors once all of its instances finished, it was
    /// never raced itself and none of its runs hit the timeout.
    pub fn is_racing_candidate(&self) -> bool {
        let buckets = self.lock();
        !buckets.has_open_or_running()
            && !buckets.raced
            && !buckets.finished.values().any(RunResult::is_cancelled)
    }

    pub fn finished_count(&self) -> usize {
        self.lock().finished.len()
    }

    pub fn fold_finished<B, F>(&self, init: B, f: F) -> B
    where
        F: FnMut(B, &RunResult) -> B,
    {
        self.lock().finished.values().fold(init, f)
    }

    pub fn freeze(&self) -> ImmutableGenomeStats<G, I> {
        let buckets = self.lock();
        ImmutableGenomeStats {
            genome: self.genome.clone(),
            total_instance_count: self.total_instance_count,
            open: buckets.open.iter().cloned().collect(),
            running: buckets.running.iter().cloned().collect(),
            finished: buckets
                .finished
                .iter()
                .map(|(instance, result)| (instance.clone(), *result))
                .collect(),
            cancelled_by_racing: buckets.cancelled_by_racing.iter().cloned().collect(),
            raced: buckets.raced,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImmutableGenomeStats<G, I> {
    pub genome: G,
    pub total_instance_count: usize,
    pub open: Vec<I>,
    pub running: Vec<I>,
    pub finished: Vec<(I, RunResult)>,
    pub cancelled_by_racing: Vec<I>,
    pub raced: bool,
}

impl<G, I> ImmutableGenomeStats<G, I> {
    pub fn bucket_total(&self) -> usize {
        self.open.len() + self.running.len() + self.finished.len() + self.cancelled_by_racing.len()
    }
}
