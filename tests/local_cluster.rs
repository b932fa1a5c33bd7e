use float_cmp::assert_approx_eq;
use futures::channel::mpsc;
use peloton::config::TunerConfigBuilder;
use peloton::error::Error;
use peloton::launch::{run_local_generation, LocalCluster};
use peloton::message::Report;
use peloton::storage::ResultStorage;
use peloton::target::from_fn;
use peloton::task::{NodeAddress, RunStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn genome_runtime(genome: &u32, _: &u32) -> Result<Option<Duration>, Error> {
    Ok(Some(Duration::from_millis(*genome as u64)))
}

#[test]
fn two_workers_evaluate_full_generation() {
    let config = TunerConfigBuilder::new()
        .workers_per_node(2)
        .build()
        .unwrap();

    let (outcome, storage) = run_local_generation(
        config,
        from_fn(genome_runtime),
        1,
        vec![20, 10],
        vec![1, 2, 3],
        ResultStorage::new(),
        None,
        false,
    )
    .unwrap();

    assert_eq!(outcome.result_count(), 6);
    let genomes: Vec<u32> = outcome.ranking.iter().map(|ranked| ranked.genome).collect();
    assert_eq!(genomes, vec![10, 20]);
    assert_approx_eq!(f64, outcome.ranking[0].score, 0.01, epsilon = 1e-9);
    assert_approx_eq!(f64, outcome.ranking[1].score, 0.02, epsilon = 1e-9);
    assert_eq!(storage.len(), 6);
}

#[test]
fn failing_target_yields_faulted_results() {
    let config = TunerConfigBuilder::new()
        .max_consecutive_failures(1)
        .build()
        .unwrap();
    let target = from_fn(|_: &u32, _: &u32| -> Result<Option<Duration>, Error> {
        Err(Error::TargetFault("segmentation fault".to_string()))
    });

    let (outcome, storage) = run_local_generation(
        config,
        target,
        1,
        vec![1],
        vec![1, 2],
        ResultStorage::new(),
        None,
        false,
    )
    .unwrap();

    let results = &outcome.ranking[0].results;
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|(_, result)| result.status == RunStatus::Faulted));
    assert!(storage.is_empty());
}

#[test]
fn slow_runs_are_cancelled_and_penalized() {
    let config = TunerConfigBuilder::new()
        .cpu_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let target = from_fn(|genome: &u32, _: &u32| -> Result<Option<Duration>, Error> {
        std::thread::sleep(Duration::from_millis(*genome as u64));
        Ok(None)
    });

    let (outcome, _) = run_local_generation(
        config,
        target,
        1,
        vec![300, 1],
        vec![1],
        ResultStorage::new(),
        None,
        false,
    )
    .unwrap();

    assert_eq!(outcome.ranking[0].genome, 1);
    let (_, slow) = outcome.ranking[1].results[0];
    assert_eq!(slow.status, RunStatus::Cancelled);
    assert_eq!(slow.runtime, Duration::from_millis(50));
    assert_approx_eq!(f64, outcome.ranking[1].score, 0.5, epsilon = 1e-9);
}

#[tokio::test]
async fn cached_results_are_reused_across_generations() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let target = from_fn(
        move |genome: &u32, instance: &u32| -> Result<Option<Duration>, Error> {
            counter.fetch_add(1, Ordering::SeqCst);
            genome_runtime(genome, instance)
        },
    );

    let config = TunerConfigBuilder::new().build().unwrap();
    let mut cluster = LocalCluster::start(config.clone(), ResultStorage::new(), None);
    cluster.add_node(NodeAddress::new("n1"), Arc::new(target));
    let coordinator = cluster.coordinator();

    let first = coordinator
        .evaluate_generation(vec![1, 2], vec![1, 2], config.strategy_factory())
        .await
        .unwrap();
    assert_eq!(first.result_count(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let second = coordinator
        .evaluate_generation(vec![2, 1, 3], vec![1, 2], config.strategy_factory())
        .await
        .unwrap();
    assert_eq!(second.result_count(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(second.ranking[0].genome, 1);

    let storage = cluster.shutdown().await.unwrap();
    assert_eq!(storage.len(), 6);
}

async fn evaluate_without(lost: NodeAddress, partition: bool) {
    let config = TunerConfigBuilder::new()
        .heartbeat(Duration::from_millis(20), Duration::from_millis(100))
        .build()
        .unwrap();
    let (report_sender, mut reports) = mpsc::unbounded();
    let mut cluster =
        LocalCluster::start(config.clone(), ResultStorage::new(), Some(report_sender));

    let target = Arc::new(from_fn(genome_runtime));
    let kept = NodeAddress::new("b");
    cluster.add_node(lost.clone(), target.clone());
    cluster.add_node(kept.clone(), target);

    if partition {
        cluster.partition_node(&lost);
        tokio::time::sleep(Duration::from_millis(400)).await;
    } else {
        cluster.stop_node(&lost);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let outcome = cluster
        .coordinator()
        .evaluate_generation(vec![1, 2], vec![1, 2, 3], config.strategy_factory())
        .await
        .unwrap();
    assert_eq!(outcome.result_count(), 6);

    cluster.shutdown().await.unwrap();

    let mut finished = 0;
    while let Ok(Some(report)) = reports.try_next() {
        if let Report::TaskFinished { worker, .. } = report {
            assert_eq!(worker.node, kept);
            finished += 1;
        }
    }
    assert_eq!(finished, 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_node_is_dropped() {
    evaluate_without(NodeAddress::new("a"), true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn departed_node_gets_no_work() {
    evaluate_without(NodeAddress::new("a"), false).await;
}

#[tokio::test]
async fn generations_are_served_in_order() {
    let config = TunerConfigBuilder::new().build().unwrap();
    let mut cluster = LocalCluster::start(config.clone(), ResultStorage::new(), None);
    let coordinator = cluster.coordinator();

    let first = coordinator.evaluate_generation(vec![1], vec![1], config.strategy_factory());
    let second = coordinator.evaluate_generation(vec![2], vec![1], config.strategy_factory());
    cluster.add_node(NodeAddress::new("n1"), Arc::new(from_fn(genome_runtime)));

    let (first, second) = futures::join!(first, second);
    assert_eq!(first.unwrap().ranking[0].genome, 1);
    assert_eq!(second.unwrap().ranking[0].genome, 2);

    cluster.shutdown().await.unwrap();
}
