use crate::error::Error;
use crate::event::{CoordinatorEvent, WorkerMessage};
use crate::target::TargetAlgorithm;
use crate::task::{GenomeInstanceTask, Key, RunResult, WorkerId};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures::future::{BoxFuture, Fuse};
use futures::{pin_mut, select, FutureExt, SinkExt, StreamExt};
use futures_timer::Delay;
use log::{debug, error, info, trace, warn};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub timeout: Duration,
    pub max_consecutive_failures: u32,
}

/// An accepted assignment starts its run in the same step, so there is no separate assigned
/// state.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Running,
}

type RunOutcome<G, I> = (GenomeInstanceTask<G, I>, Result<RunResult, Error>);

async fn run_with_timeout<G, I, T>(
    target: &T,
    task: &GenomeInstanceTask<G, I>,
    timeout: Duration,
) -> Result<RunResult, Error>
where
    G: Key,
    I: Key,
    T: TargetAlgorithm<G, I>,
{
    let started = Instant::now();
    let run_fut = target.run(&task.genome, &task.instance).fuse();
    let timeout_fut = Delay::new(timeout).fuse();
    pin_mut!(run_fut, timeout_fut);

    select! {
        () = timeout_fut => {
            trace!("Timeout after {:?} on {:?}, cancelling run", timeout, task);
            Ok(RunResult::cancelled(timeout))
        }
        outcome = run_fut => outcome.map(|reported| {
            let runtime = reported.unwrap_or_else(|| started.elapsed());
            if runtime >= timeout {
                RunResult::cancelled(timeout)
            } else {
                RunResult::completed(runtime)
            }
        }),
    }
}

async fn evaluate<G, I, T>(
    worker: WorkerId,
    target: Arc<T>,
    task: GenomeInstanceTask<G, I>,
    settings: WorkerSettings,
) -> RunOutcome<G, I>
where
    G: Key,
    I: Key,
    T: TargetAlgorithm<G, I>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match run_with_timeout(target.as_ref(), &task, settings.timeout).await {
            Ok(result) => return (task, Ok(result)),
            Err(cause) if attempts > settings.max_consecutive_failures => {
                error!(
                    "Worker {}: {:?} failed {} times in a row, giving up: {}",
                    worker, task, attempts, cause
                );
                let failure = Error::TaskFailed {
                    task: format!("{:?}", task),
                    attempts,
                    cause: cause.to_string(),
                };
                return (task, Err(failure));
            }
            Err(cause) => {
                warn!(
                    "Worker {}: attempt {} on {:?} failed, retrying: {}",
                    worker, attempts, task, cause
                );
            }
        }
    }
}

/// Evaluates one task at a time. Answers polls only while idle, so it never holds more than one
/// task. Ends on `Stop` or when its inbox closes, dropping any run in flight.
pub async fn start_worker<G, I, T>(
    id: WorkerId,
    target: Arc<T>,
    settings: WorkerSettings,
    mut inbox: UnboundedReceiver<WorkerMessage<G, I>>,
    mut event_sender: UnboundedSender<CoordinatorEvent<G, I>>,
) -> Result<(), Error>
where
    G: Key,
    I: Key,
    T: TargetAlgorithm<G, I>,
{
    let mut state = WorkerState::Idle;
    let mut run: Fuse<BoxFuture<'static, RunOutcome<G, I>>> = Fuse::terminated();

    loop {
        select! {
            message = inbox.next() => match message {
                Some(WorkerMessage::Poll) => {
                    if state == WorkerState::Idle {
                        event_sender
                            .send(CoordinatorEvent::WorkerAccepted { worker: id.clone() })
                            .await
                            .ok();
                    }
                }
                Some(WorkerMessage::Assign(task)) => {
                    if state != WorkerState::Idle {
                        debug!("Worker {} is {}, rejecting {:?}", id, state, task);
                        event_sender
                            .send(CoordinatorEvent::TaskRejected { worker: id.clone(), task })
                            .await
                            .ok();
                        continue;
                    }

                    debug!("Worker {} assigned {:?}", id, task);
                    run = evaluate(id.clone(), target.clone(), task, settings)
                        .boxed()
                        .fuse();
                    state = WorkerState::Running;
                }
                Some(WorkerMessage::Stop) | None => {
                    if state == WorkerState::Running {
                        info!("Worker {} stopping, cancelling run in flight", id);
                    }
                    return Ok(());
                }
            },
            (task, outcome) = run => {
                state = WorkerState::Idle;
                let event = match outcome {
                    Ok(result) => CoordinatorEvent::TaskCompleted {
                        worker: id.clone(),
                        task,
                        result,
                    },
                    Err(cause) => CoordinatorEvent::TaskFailed {
                        worker: id.clone(),
                        task,
                        cause,
                    },
                };
                event_sender.send(event).await.ok();
            }
        }
    }
}
