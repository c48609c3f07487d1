//! Worker process: executes assigned tasks and serves its own intermediate
//! shards to remote reducers.

use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use uuid::Uuid;

use crate::fs::{FileSystem, Perm};
use crate::pb::worker_client::WorkerClient;
use crate::pb::worker_server::{Worker as WorkerRpc, WorkerServer};
use crate::pb::{
    AssignReply, AssignRequest, DestroyReply, DestroyRequest, HeartbeatReply, HeartbeatRequest,
    KeyValue, NotifyReply, NotifyRequest, ReadReply, ReadRequest, TaskState, TaskType,
};
use crate::{pb, Workload};

pub mod iterator;
pub mod task;

use iterator::RemoteKVReader;
use task::{Task, TaskParams, TaskSpec};

/// One worker's identity, directories, and active task set.
///
/// Tasks are never removed from the table: the coordinator keeps learning
/// their terminal status from heartbeat replies, and duplicate reports are
/// cheap to ignore on its side.
pub struct Worker {
    id: String,
    local_dir: PathBuf,
    data_path: String,
    data_fs: Arc<dyn FileSystem>,
    workload: Workload,
    tasks: DashMap<(i32, u64), Arc<Task>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Notify,
    stopped: AtomicBool,
}

impl Worker {
    /// Creates the worker's directory tree under `root` and its identity:
    ///
    /// ```text
    /// <root>/<worker id>/data    intermediate shards
    /// <root>/<worker id>/log     diagnostics
    /// ```
    pub fn init(root: &Path, workload: Workload) -> Result<Arc<Self>> {
        let id = Uuid::new_v4().to_string();
        let local_dir = root.join(&id);
        std::fs::create_dir_all(local_dir.join("data"))?;
        std::fs::create_dir_all(local_dir.join("log"))?;
        let data_path = local_dir.join("data").display().to_string();
        let data_fs = crate::fs::from_url(&format!("local://{data_path}"))?;
        Ok(Arc::new(Self {
            id,
            local_dir,
            data_path,
            data_fs,
            workload,
            tasks: DashMap::new(),
            handles: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Binds a listener (port 0 picks a free one) and serves the worker RPC
    /// surface on it.
    pub async fn serve(self: &Arc<Self>, port: u16) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        let svc = WorkerServer::new(WorkerSvc(Arc::clone(self)));
        let id = self.id.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) =
                Server::builder().add_service(svc).serve_with_incoming(TcpListenerStream::new(listener)).await
            {
                warn!(worker = %id, "rpc server stopped: {err}");
            }
        });
        info!(worker = %self.id, %addr, "worker listening");
        Ok((addr, handle))
    }

    /// Announces this worker to the coordinator.
    pub async fn register(&self, coordinator_addr: &str, listen_addr: SocketAddr) -> Result<()> {
        let mut client =
            pb::coordinator_client::CoordinatorClient::connect(format!("http://{coordinator_addr}"))
                .await
                .with_context(|| format!("dial coordinator at {coordinator_addr}"))?;
        let reply = client
            .register(pb::RegisterRequest { id: self.id.clone(), addr: listen_addr.to_string() })
            .await?
            .into_inner();
        crate::ensure_ok(&reply.s).context("register")?;
        info!(worker = %self.id, "registered with coordinator");
        Ok(())
    }

    /// Blocks until `Destroy` arrives, then drains outstanding task
    /// executors.
    pub async fn wait(&self) {
        self.shutdown.notified().await;
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
        info!(worker = %self.id, "worker stopped");
    }

    fn check_identity(&self, id: &str) -> Option<String> {
        if id != self.id {
            Some(format!("obsolete worker id [{}], current [{}]", id, self.id))
        } else {
            None
        }
    }
}

/// Paginated scan over a locally persisted shard.
///
/// Returns records positioned after the `(last_key, offset)` cursor, at most
/// `max_count`; a short result means end of shard.
fn scan_shard(
    fs: &dyn FileSystem,
    file_id: u64,
    last_key: &str,
    offset: u64,
    max_count: usize,
) -> Result<Vec<KeyValue>> {
    let fh = fs.open(&format!("map-{file_id}"), Perm::Read)?;
    let mut seen = 0u64;
    let mut out = Vec::new();
    for line in BufReader::new(fh).lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(' ') else {
            anyhow::bail!("malformed shard record: {line:?}");
        };
        if key == last_key {
            seen += 1;
        }
        if seen > offset || key > last_key {
            out.push(KeyValue { key: key.to_string(), value: value.to_string() });
            if out.len() == max_count {
                break;
            }
        }
    }
    Ok(out)
}

/// gRPC surface of a [`Worker`].
pub struct WorkerSvc(pub Arc<Worker>);

#[tonic::async_trait]
impl WorkerRpc for WorkerSvc {
    async fn assign(&self, request: Request<AssignRequest>) -> Result<Response<AssignReply>, Status> {
        let req = request.into_inner();
        if let Some(msg) = self.0.check_identity(&req.id) {
            return Ok(Response::new(AssignReply { s: pb::Status::fail(msg) }));
        }
        let spec = match req.task_type() {
            TaskType::Map => TaskSpec::Map {
                input_path: req.input_path,
                input_files: req.input_files,
                local_path: self.0.data_path.clone(),
                total_reduce: req.total_reduce as usize,
                map_fn: self.0.workload.map_fn,
            },
            TaskType::Reduce => TaskSpec::Reduce {
                output_path: req.output_path,
                total_map: req.total_map as usize,
                reduce_fn: self.0.workload.reduce_fn,
            },
        };
        let params = TaskParams {
            task_id: req.task_id,
            file_id: req.file_id,
            worker_id: self.0.id.clone(),
            spec,
        };
        let task_type = params.task_type();
        let started = Task::new(params).and_then(|task| Ok((task.start()?, task)));
        let reply = match started {
            Ok((handle, task)) => {
                info!(worker = %self.0.id, ?task_type, task_id = req.task_id, "task assigned");
                self.0.tasks.insert((task_type as i32, req.task_id), task);
                self.0.handles.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
                AssignReply { s: pb::Status::ok() }
            }
            Err(err) => {
                warn!(worker = %self.0.id, task_id = req.task_id, "assign failed: {err:#}");
                AssignReply { s: pb::Status::fail(format!("fail to start task: {err:#}")) }
            }
        };
        Ok(Response::new(reply))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatReply>, Status> {
        let req = request.into_inner();
        if let Some(msg) = self.0.check_identity(&req.id) {
            return Ok(Response::new(HeartbeatReply { s: pb::Status::fail(msg), tasks: vec![] }));
        }
        let tasks = self
            .0
            .tasks
            .iter()
            .map(|entry| {
                let (task_type, task_id, status) = entry.value().info();
                TaskState { task_id, task_type: task_type as i32, status: status as i32 }
            })
            .collect();
        Ok(Response::new(HeartbeatReply { s: pb::Status::ok(), tasks }))
    }

    async fn read(&self, request: Request<ReadRequest>) -> Result<Response<ReadReply>, Status> {
        let req = request.into_inner();
        if let Some(msg) = self.0.check_identity(&req.id) {
            return Ok(Response::new(ReadReply { s: pb::Status::fail(msg), kvs: vec![] }));
        }
        let reply = match scan_shard(
            self.0.data_fs.as_ref(),
            req.file_id,
            &req.last_key,
            req.offset,
            req.max_count as usize,
        ) {
            Ok(kvs) => ReadReply { s: pb::Status::ok(), kvs },
            Err(err) => ReadReply {
                s: pb::Status::fail(format!("fail to read shard {}: {err:#}", req.file_id)),
                kvs: vec![],
            },
        };
        Ok(Response::new(reply))
    }

    async fn notify(&self, request: Request<NotifyRequest>) -> Result<Response<NotifyReply>, Status> {
        let req = request.into_inner();
        if let Some(msg) = self.0.check_identity(&req.id) {
            return Ok(Response::new(NotifyReply { s: pb::Status::fail(msg) }));
        }
        if req.task_type() != TaskType::Reduce {
            return Ok(Response::new(NotifyReply {
                s: pb::Status::fail("notify is only valid for reduce tasks"),
            }));
        }
        // Dial the new producer up front; a dead address surfaces here and
        // the coordinator simply re-notifies next cycle.
        let client = match WorkerClient::connect(format!("http://{}", req.new_addr)).await {
            Ok(client) => client,
            Err(err) => {
                warn!(worker = %self.0.id, addr = %req.new_addr, "notify dial failed: {err}");
                return Ok(Response::new(NotifyReply {
                    s: pb::Status::fail(format!("fail to dial {}: {err}", req.new_addr)),
                }));
            }
        };
        let reader = RemoteKVReader::new(client, req.new_id.clone(), req.new_file_id);
        let reply = match self.0.tasks.get(&(TaskType::Reduce as i32, req.reduce_task_id)) {
            Some(task) => {
                match task.notify(req.mapper_task_id, &req.old_id, &req.new_id, Box::new(reader)) {
                    Ok(()) => NotifyReply { s: pb::Status::ok() },
                    Err(err) => NotifyReply { s: pb::Status::fail(format!("fail to notify: {err:#}")) },
                }
            }
            // not tracking that reducer (e.g. it was reassigned away); fine
            None => NotifyReply { s: pb::Status::ok() },
        };
        Ok(Response::new(reply))
    }

    async fn destroy(&self, request: Request<DestroyRequest>) -> Result<Response<DestroyReply>, Status> {
        let req = request.into_inner();
        if let Some(msg) = self.0.check_identity(&req.id) {
            return Ok(Response::new(DestroyReply { s: pb::Status::fail(msg) }));
        }
        if !self.0.stopped.swap(true, Ordering::SeqCst) {
            info!(worker = %self.0.id, "destroy received, shutting down");
            self.0.shutdown.notify_one();
        }
        Ok(Response::new(DestroyReply { s: pb::Status::ok() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_shard(dir: &Path, file_id: u64, lines: &[&str]) {
        let mut f = std::fs::File::create(dir.join(format!("map-{file_id}"))).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    fn fs_at(dir: &Path) -> Arc<dyn FileSystem> {
        crate::fs::from_url(&format!("local://{}", dir.display())).unwrap()
    }

    #[test]
    fn scan_pages_through_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), 3, &["a 1", "b 2", "b 3", "b 4", "c 5"]);
        let fs = fs_at(dir.path());

        // first page ends inside the run of `b`s
        let page = scan_shard(fs.as_ref(), 3, "", 0, 3).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[2], KeyValue { key: "b".into(), value: "3".into() });

        // cursor (b, 2): two b-records already consumed
        let page = scan_shard(fs.as_ref(), 3, "b", 2, 3).unwrap();
        let got: Vec<_> = page.iter().map(|kv| kv.value.as_str()).collect();
        assert_eq!(got, vec!["4", "5"]);

        // fully consumed: short (empty) page
        assert!(scan_shard(fs.as_ref(), 3, "c", 1, 3).unwrap().is_empty());
    }

    #[test]
    fn scan_rejects_malformed_records() {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), 9, &["a 1", "garbage-without-space"]);
        let fs = fs_at(dir.path());
        assert!(scan_shard(fs.as_ref(), 9, "", 0, 10).is_err());
    }

    #[test]
    fn scan_of_missing_shard_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fs = fs_at(dir.path());
        assert!(scan_shard(fs.as_ref(), 1, "", 0, 10).is_err());
    }
}
