use crate::error::Error;
use crate::task::Key;
use async_trait::async_trait;
use std::panic;
use std::sync::Arc;
use std::time::Duration;

/// The algorithm being tuned.
#[async_trait]
pub trait TargetAlgorithm<G, I>: Send + Sync + 'static {
    async fn run(&self, genome: &G, instance: &I) -> Result<Option<Duration>, Error>;
}

pub struct FnTarget<F> {
    func: Arc<F>,
}

pub fn from_fn<G, I, F>(func: F) -> FnTarget<F>
where
    F: Fn(&G, &I) -> Result<Option<Duration>, Error> + Send + Sync + 'static,
{
    FnTarget {
        func: Arc::new(func),
    }
}

#[async_trait]
impl<G, I, F> TargetAlgorithm<G, I> for FnTarget<F>
where
    G: Key,
    I: Key,
    F: Fn(&G, &I) -> Result<Option<Duration>, Error> + Send + Sync + 'static,
{
    async fn run(&self, genome: &G, instance: &I) -> Result<Option<Duration>, Error> {
        let func = self.func.clone();
        let genome = genome.clone();
        let instance = instance.clone();

        match tokio::task::spawn_blocking(move || func(&genome, &instance)).await {
            Ok(res) => res,
            Err(join_error) if join_error.is_panic() => {
                panic::resume_unwind(join_error.into_panic())
            }
            Err(join_error) => Err(Error::TargetFault(join_error.to_string())),
        }
    }
}
