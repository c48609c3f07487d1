//! Coordinator scheduling and fault-tolerance scenario, driven by a mock
//! worker service that scripts completions and crashes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use minimr::coordinator::{Coordinator, CoordinatorOptions};
use minimr::pb::worker_server::{Worker as WorkerRpc, WorkerServer};
use minimr::pb::{
    self, AssignReply, AssignRequest, DestroyReply, DestroyRequest, HeartbeatReply,
    HeartbeatRequest, NotifyReply, NotifyRequest, ReadReply, ReadRequest, TaskState, TaskStatus,
    TaskType,
};

/// Scripted state shared between the test body and the mock service. One
/// server hosts every mock worker identity; the coordinator only ever sees
/// the ids it was given at registration.
#[derive(Default)]
struct MockState {
    mappers: HashMap<String, Vec<u64>>,
    reducers: HashMap<String, Vec<u64>>,
    /// Workers whose map tasks report Complete.
    finished: HashSet<String>,
    /// Workers that refuse heartbeats, as a crashed process would.
    failed: HashSet<String>,
    /// When set, reduce tasks report Complete too.
    persist: bool,
    /// Map task ids a worker reports Complete without owning them.
    claimed_maps: HashMap<String, Vec<u64>>,
    /// Reduce task ids a worker reports Complete without owning them.
    claimed_reduces: HashMap<String, Vec<u64>>,
    /// Every NotifyRequest the mock has received.
    notifies: Vec<NotifyRequest>,
}

#[derive(Clone, Default)]
struct MockWorker(Arc<Mutex<MockState>>);

#[tonic::async_trait]
impl WorkerRpc for MockWorker {
    async fn assign(&self, request: Request<AssignRequest>) -> Result<Response<AssignReply>, Status> {
        let req = request.into_inner();
        let mut st = self.0.lock().unwrap();
        let table = match req.task_type() {
            TaskType::Map => &mut st.mappers,
            TaskType::Reduce => &mut st.reducers,
        };
        table.entry(req.id).or_default().push(req.task_id);
        Ok(Response::new(AssignReply { s: pb::Status::ok() }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatReply>, Status> {
        let req = request.into_inner();
        let st = self.0.lock().unwrap();
        if st.failed.contains(&req.id) {
            return Ok(Response::new(HeartbeatReply {
                s: pb::Status::fail("scripted crash"),
                tasks: vec![],
            }));
        }
        let mut tasks = Vec::new();
        for &task_id in st.mappers.get(&req.id).into_iter().flatten() {
            let status =
                if st.finished.contains(&req.id) { TaskStatus::Complete } else { TaskStatus::InProgress };
            tasks.push(TaskState { task_id, task_type: TaskType::Map as i32, status: status as i32 });
        }
        for &task_id in st.reducers.get(&req.id).into_iter().flatten() {
            let status = if st.persist { TaskStatus::Complete } else { TaskStatus::InProgress };
            tasks.push(TaskState { task_id, task_type: TaskType::Reduce as i32, status: status as i32 });
        }
        for &task_id in st.claimed_maps.get(&req.id).into_iter().flatten() {
            tasks.push(TaskState {
                task_id,
                task_type: TaskType::Map as i32,
                status: TaskStatus::Complete as i32,
            });
        }
        for &task_id in st.claimed_reduces.get(&req.id).into_iter().flatten() {
            tasks.push(TaskState {
                task_id,
                task_type: TaskType::Reduce as i32,
                status: TaskStatus::Complete as i32,
            });
        }
        Ok(Response::new(HeartbeatReply { s: pb::Status::ok(), tasks }))
    }

    async fn read(&self, _request: Request<ReadRequest>) -> Result<Response<ReadReply>, Status> {
        Ok(Response::new(ReadReply { s: pb::Status::ok(), kvs: vec![] }))
    }

    async fn notify(&self, request: Request<NotifyRequest>) -> Result<Response<NotifyReply>, Status> {
        self.0.lock().unwrap().notifies.push(request.into_inner());
        Ok(Response::new(NotifyReply { s: pb::Status::ok() }))
    }

    async fn destroy(&self, _request: Request<DestroyRequest>) -> Result<Response<DestroyReply>, Status> {
        Ok(Response::new(DestroyReply { s: pb::Status::ok() }))
    }
}

async fn serve_mock(mock: MockWorker) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        Server::builder()
            .add_service(WorkerServer::new(mock))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    addr.to_string()
}

fn count(table: &HashMap<String, Vec<u64>>, id: &str) -> usize {
    table.get(id).map_or(0, |v| v.len())
}

#[tokio::test(flavor = "multi_thread")]
async fn schedules_rebalances_and_survives_a_crash() {
    let mock = MockWorker::default();
    let addr = serve_mock(mock.clone()).await;

    let coordinator = Coordinator::new(CoordinatorOptions {
        input_path: ".".into(),
        output_path: ".".into(),
        input_files: (0..4).map(|i| format!("in-{i}")).collect(),
        n_reduce: 2,
        max_tasks_per_worker: 2,
    })
    .unwrap();
    let job = tokio::spawn(Arc::clone(&coordinator).run());

    // First worker joins: it gets map tasks up to its cap.
    coordinator.register("worker-1".into(), addr.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    {
        let st = mock.0.lock().unwrap();
        assert_eq!(count(&st.mappers, "worker-1"), 2);
        assert_eq!(count(&st.reducers, "worker-1"), 0);
    }

    // Second worker joins: the remaining maps land on it.
    coordinator.register("worker-2".into(), addr.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    {
        let st = mock.0.lock().unwrap();
        assert_eq!(count(&st.mappers, "worker-2"), 2);
    }

    // worker-1 finishes its maps: freed capacity goes to the reducers.
    mock.0.lock().unwrap().finished.insert("worker-1".into());
    tokio::time::sleep(Duration::from_secs(3)).await;
    {
        let st = mock.0.lock().unwrap();
        assert_eq!(count(&st.reducers, "worker-1"), 2);
    }

    // worker-2 crashes: its maps are reclaimed and re-executed on worker-1
    // even though worker-1 is already at its cap running reducers.
    mock.0.lock().unwrap().failed.insert("worker-2".into());
    tokio::time::sleep(Duration::from_secs(3)).await;
    {
        let st = mock.0.lock().unwrap();
        let ids: HashSet<u64> = st.mappers.get("worker-1").unwrap().iter().copied().collect();
        assert_eq!(ids, HashSet::from([0, 1, 2, 3]));
    }

    // Reducers persist their output: the job runs to completion, surviving
    // the repeated Complete reports every later heartbeat carries.
    mock.0.lock().unwrap().persist = true;
    tokio::time::timeout(Duration::from_secs(10), job)
        .await
        .expect("job did not finish")
        .unwrap();

    // A finished job admits no new workers.
    assert!(coordinator.register("worker-3".into(), addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_reports_from_non_owners_are_ignored() {
    let mock = MockWorker::default();
    let addr = serve_mock(mock.clone()).await;

    let coordinator = Coordinator::new(CoordinatorOptions {
        input_path: ".".into(),
        output_path: ".".into(),
        input_files: (0..4).map(|i| format!("in-{i}")).collect(),
        n_reduce: 2,
        max_tasks_per_worker: 2,
    })
    .unwrap();
    let job = tokio::spawn(Arc::clone(&coordinator).run());

    coordinator.register("worker-1".into(), addr.clone()).await.unwrap();
    coordinator.register("worker-2".into(), addr.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    {
        let st = mock.0.lock().unwrap();
        assert_eq!(count(&st.mappers, "worker-1"), 2);
        assert_eq!(count(&st.mappers, "worker-2"), 2);
    }

    // worker-2 claims worker-1's map tasks are done. Were that believed, the
    // freed capacity would pull reducers in and the notify loop would start
    // advertising those mappers.
    mock.0.lock().unwrap().claimed_maps.insert("worker-2".into(), vec![0, 1]);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    {
        let st = mock.0.lock().unwrap();
        assert_eq!(count(&st.reducers, "worker-1"), 0);
        assert_eq!(count(&st.reducers, "worker-2"), 0);
        assert!(st.notifies.is_empty());
    }

    // The true owner finishes: now reducers run, and every notify names the
    // owner as the shard's producer.
    mock.0.lock().unwrap().finished.insert("worker-1".into());
    tokio::time::sleep(Duration::from_secs(3)).await;
    {
        let st = mock.0.lock().unwrap();
        assert_eq!(count(&st.reducers, "worker-1"), 2);
        assert!(!st.notifies.is_empty());
        for n in &st.notifies {
            assert!([0, 1].contains(&n.mapper_task_id));
            assert_eq!(n.new_id, "worker-1");
        }
    }

    // worker-2 claims the reduce tasks it does not host are done; the job
    // must not finish on its word.
    mock.0.lock().unwrap().claimed_reduces.insert("worker-2".into(), vec![0, 1]);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!job.is_finished());

    // Only the real owners' reports end the job.
    {
        let mut st = mock.0.lock().unwrap();
        st.finished.insert("worker-2".into());
        st.persist = true;
    }
    tokio::time::timeout(Duration::from_secs(10), job)
        .await
        .expect("job did not finish")
        .unwrap();
}
