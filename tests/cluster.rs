//! Two real workers and a coordinator in one process, moving actual bytes:
//! map tasks write shards, reducers pull them over gRPC and publish output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use minimr::coordinator::{Coordinator, CoordinatorOptions};
use minimr::worker::Worker;
use minimr::{ihash, workload};

const INPUTS: [&str; 4] = [
    "the quick brown fox jumps over the lazy dog",
    "the dog barks and the fox runs",
    "pack my box with five dozen liquor jugs",
    "the five boxing wizards jump quickly over the lazy dog",
];

const N_REDUCE: usize = 2;

fn expected_outputs() -> Vec<Vec<String>> {
    let mut parts: Vec<BTreeMap<&str, u64>> = vec![BTreeMap::new(); N_REDUCE];
    for text in INPUTS {
        for word in text.split_whitespace() {
            *parts[ihash(word) as usize % N_REDUCE].entry(word).or_default() += 1;
        }
    }
    parts
        .into_iter()
        .map(|m| m.into_iter().map(|(k, v)| format!("{k} {v}")).collect())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn word_count_job_runs_end_to_end() {
    let input_dir = tempfile::tempdir().unwrap();
    let result_dir = tempfile::tempdir().unwrap();
    let worker_root = tempfile::tempdir().unwrap();

    let mut input_files = Vec::new();
    for (i, text) in INPUTS.iter().enumerate() {
        let path = input_dir.path().join(format!("in-{i}"));
        std::fs::write(&path, text).unwrap();
        input_files.push(path.display().to_string());
    }

    let coordinator = Coordinator::new(CoordinatorOptions {
        input_path: ".".into(),
        output_path: result_dir.path().display().to_string(),
        input_files,
        n_reduce: N_REDUCE,
        max_tasks_per_worker: 4,
    })
    .unwrap();
    let job = tokio::spawn(Arc::clone(&coordinator).run());

    let wc = workload::named("wc").unwrap();
    for _ in 0..2 {
        let worker = Worker::init(worker_root.path(), wc).unwrap();
        let (addr, _server) = worker.serve(0).await.unwrap();
        coordinator.register(worker.id().to_string(), addr.to_string()).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(30), job)
        .await
        .expect("job did not finish")
        .unwrap();

    for (partition, want) in expected_outputs().into_iter().enumerate() {
        let path = result_dir.path().join(format!("mr-out-{partition}"));
        let got: Vec<String> =
            std::fs::read_to_string(&path).unwrap().lines().map(String::from).collect();
        assert_eq!(got, want, "partition {partition}");
    }
}
