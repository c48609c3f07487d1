//! Coordinator: owns the task tables and drives the job with three loops.
//!
//! * schedule loop: hands Idle tasks to the least-loaded healthy worker
//! * heartbeat loop: polls workers, harvests completions, declares crashes
//! * notify loop: tells running reducers where every completed map's shard
//!   currently lives, which doubles as the repair path after a mapper's
//!   host crashes
//!
//! All tables live behind one mutex; the loops snapshot what they need and
//! do RPC work outside it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::pb::coordinator_server::Coordinator as CoordinatorRpc;
use crate::pb::worker_client::WorkerClient;
use crate::pb::{
    self, AssignRequest, DestroyRequest, HeartbeatRequest, NotifyRequest, RegisterReply,
    RegisterRequest, TaskStatus, TaskType,
};
use crate::worker::iterator::RPC_MAX_RETRIES;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const NOTIFY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WorkerHealth {
    Healthy,
    Crashed,
}

/// A registered worker. Crashed workers stay in the table so indices held
/// elsewhere (`worker_idx`, `old_worker_idx`) stay valid; every loop skips
/// them.
struct WorkerEntry {
    id: String,
    addr: String,
    health: WorkerHealth,
    mapper_ids: Vec<u64>,
    reducer_ids: Vec<u64>,
    client: WorkerClient<Channel>,
}

struct TaskEntry {
    status: TaskStatus,
    task_id: u64,
    file_id: u64,
    worker_idx: Option<usize>,
    /// Who ran this task before its host crashed; reducers use it to match
    /// re-route notifications against their current binding.
    old_worker_idx: Option<usize>,
}

impl TaskEntry {
    fn new(task_id: u64, file_id: u64) -> Self {
        Self { status: TaskStatus::Idle, task_id, file_id, worker_idx: None, old_worker_idx: None }
    }
}

pub struct CoordinatorOptions {
    pub input_path: String,
    pub output_path: String,
    pub input_files: Vec<String>,
    pub n_reduce: usize,
    /// Upper bound on concurrently running tasks per worker. Mappers may
    /// exceed it once reducing has begun, so a crashed mapper's re-execution
    /// is never starved by long-running reducers.
    pub max_tasks_per_worker: usize,
}

struct State {
    workers: Vec<WorkerEntry>,
    mappers: Vec<TaskEntry>,
    reducers: Vec<TaskEntry>,
    unfinished_reducers: usize,
}

pub struct Coordinator {
    opts: CoordinatorOptions,
    state: Mutex<State>,
    /// Kicks the schedule loop; set by registration and by harvested events.
    sched: Notify,
}

impl Coordinator {
    pub fn new(opts: CoordinatorOptions) -> Result<Arc<Self>> {
        if opts.input_files.is_empty() {
            bail!("no input files");
        }
        if opts.n_reduce == 0 {
            bail!("n_reduce must be positive");
        }
        // Mapper i writes shards file_id .. file_id + n_reduce, so mapper
        // file ids are spaced n_reduce apart; reducer i owns partition i.
        let mappers = (0..opts.input_files.len())
            .map(|i| TaskEntry::new(i as u64, (i * opts.n_reduce) as u64))
            .collect();
        let reducers = (0..opts.n_reduce).map(|i| TaskEntry::new(i as u64, i as u64)).collect();
        let unfinished_reducers = opts.n_reduce;
        Ok(Arc::new(Self {
            opts,
            state: Mutex::new(State { workers: Vec::new(), mappers, reducers, unfinished_reducers }),
            sched: Notify::new(),
        }))
    }

    /// Admits a worker into the pool. Safe to call again with the same id.
    pub async fn register(&self, id: String, addr: String) -> Result<()> {
        {
            let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.unfinished_reducers == 0 {
                bail!("job already finished");
            }
            if st.workers.iter().any(|w| w.id == id) {
                return Ok(());
            }
        }
        // Dial outside the lock; re-check for a racing duplicate after.
        let client = WorkerClient::connect(format!("http://{addr}")).await?;
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.workers.iter().any(|w| w.id == id) {
            return Ok(());
        }
        info!(worker = %id, %addr, "worker registered");
        st.workers.push(WorkerEntry {
            id,
            addr,
            health: WorkerHealth::Healthy,
            mapper_ids: Vec::new(),
            reducer_ids: Vec::new(),
            client,
        });
        drop(st);
        self.sched.notify_one();
        Ok(())
    }

    /// Runs the job to completion: spawns the three loops, waits for every
    /// reducer to finish, then tears the workers down.
    pub async fn run(self: Arc<Self>) {
        let schedule = tokio::spawn(Arc::clone(&self).schedule_loop());
        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat_loop());
        let notify = tokio::spawn(Arc::clone(&self).notify_loop());
        let _ = tokio::join!(schedule, heartbeat, notify);
        self.destroy_all().await;
        info!("job complete");
    }

    fn done(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).unfinished_reducers == 0
    }

    async fn schedule_loop(self: Arc<Self>) {
        loop {
            let notified = self.sched.notified();
            if self.done() {
                return;
            }
            let batch = self.schedule_once();
            for (worker_id, mut client, req) in batch {
                tokio::spawn(async move {
                    for attempt in 0..RPC_MAX_RETRIES {
                        match client.assign(req.clone()).await {
                            Ok(reply) => match crate::ensure_ok(&reply.into_inner().s) {
                                Ok(()) => return,
                                Err(err) => {
                                    // refused assignments are reclaimed once
                                    // the heartbeat declares the worker dead
                                    warn!(worker = %worker_id, "assign rejected: {err:#}");
                                    return;
                                }
                            },
                            Err(err) => {
                                debug!(worker = %worker_id, attempt, "assign rpc failed: {err}")
                            }
                        }
                    }
                    warn!(worker = %worker_id, task_id = req.task_id, "assign gave up");
                });
            }
            notified.await;
        }
    }

    /// Binds every schedulable Idle task to a worker and returns the RPCs to
    /// send. Table mutation happens here, under the lock; the network happens
    /// in the caller.
    fn schedule_once(&self) -> Vec<(String, WorkerClient<Channel>, AssignRequest)> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let st = &mut *st;
        let mut batch = Vec::new();

        let n_map = st.mappers.len() as u32;
        let reducing_started = st.reducers.iter().any(|r| r.status != TaskStatus::Idle);
        for i in 0..st.mappers.len() {
            if st.mappers[i].status != TaskStatus::Idle {
                continue;
            }
            // Once reducers occupy workers, map re-executions ignore the cap.
            let cap = if reducing_started { usize::MAX } else { self.opts.max_tasks_per_worker };
            let Some(w) = pick_worker(st, cap) else { break };
            let (task_id, file_id) = {
                let task = &mut st.mappers[i];
                task.status = TaskStatus::InProgress;
                task.worker_idx = Some(w);
                (task.task_id, task.file_id)
            };
            st.workers[w].mapper_ids.push(task_id);
            let req = AssignRequest {
                id: st.workers[w].id.clone(),
                task_type: TaskType::Map as i32,
                task_id,
                input_files: vec![self.opts.input_files[task_id as usize].clone()],
                input_path: self.opts.input_path.clone(),
                output_path: String::new(),
                file_id,
                total_reduce: self.opts.n_reduce as u32,
                total_map: n_map,
            };
            info!(worker = %st.workers[w].id, task_id, "map task scheduled");
            batch.push((st.workers[w].id.clone(), st.workers[w].client.clone(), req));
        }

        for i in 0..st.reducers.len() {
            if st.reducers[i].status != TaskStatus::Idle {
                continue;
            }
            let Some(w) = pick_worker(st, self.opts.max_tasks_per_worker) else { break };
            let (task_id, file_id) = {
                let task = &mut st.reducers[i];
                task.status = TaskStatus::InProgress;
                task.worker_idx = Some(w);
                (task.task_id, task.file_id)
            };
            st.workers[w].reducer_ids.push(task_id);
            let req = AssignRequest {
                id: st.workers[w].id.clone(),
                task_type: TaskType::Reduce as i32,
                task_id,
                input_files: Vec::new(),
                input_path: String::new(),
                output_path: self.opts.output_path.clone(),
                file_id,
                total_reduce: self.opts.n_reduce as u32,
                total_map: n_map,
            };
            info!(worker = %st.workers[w].id, task_id, "reduce task scheduled");
            batch.push((st.workers[w].id.clone(), st.workers[w].client.clone(), req));
        }
        batch
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            if self.done() {
                return;
            }
            let targets: Vec<(usize, String, WorkerClient<Channel>)> = {
                let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
                st.workers
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| w.health == WorkerHealth::Healthy)
                    .map(|(i, w)| (i, w.id.clone(), w.client.clone()))
                    .collect()
            };
            let mut polls = JoinSet::new();
            for (idx, id, client) in targets {
                let this = Arc::clone(&self);
                polls.spawn(async move { this.heartbeat_one(idx, id, client).await });
            }
            let mut events = false;
            while let Some(res) = polls.join_next().await {
                events |= res.unwrap_or(false);
            }
            if events {
                self.sched.notify_one();
            }
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        }
    }

    /// Polls one worker. Returns whether anything changed that the scheduler
    /// should react to.
    async fn heartbeat_one(
        self: Arc<Self>,
        idx: usize,
        id: String,
        mut client: WorkerClient<Channel>,
    ) -> bool {
        let mut reply = None;
        for _ in 0..RPC_MAX_RETRIES {
            match client.heartbeat(HeartbeatRequest { id: id.clone() }).await {
                Ok(r) => {
                    reply = Some(r.into_inner());
                    break;
                }
                Err(_) => continue,
            }
        }
        let tasks = match reply {
            Some(r) if crate::ensure_ok(&r.s).is_ok() => r.tasks,
            Some(r) => {
                warn!(worker = %id, "heartbeat refused: {:?}, declaring crashed", r.s);
                self.mark_crashed(idx);
                return true;
            }
            None => {
                warn!(worker = %id, "heartbeat unreachable, declaring crashed");
                self.mark_crashed(idx);
                return true;
            }
        };
        let mut events = false;
        for ts in tasks {
            if ts.status() != TaskStatus::Complete {
                continue;
            }
            events |= match ts.task_type() {
                TaskType::Map => self.finish_mapper(idx, ts.task_id),
                TaskType::Reduce => self.finish_reducer(idx, ts.task_id),
            };
        }
        events
    }

    fn finish_mapper(&self, worker_idx: usize, task_id: u64) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = st.mappers.get_mut(task_id as usize) else {
            warn!(task_id, "completion report for unknown map task");
            return false;
        };
        if task.worker_idx != Some(worker_idx) {
            // a reclaimed task finishing on its old host; its shards are gone
            debug!(task_id, worker_idx, "map completion from a non-owner, ignored");
            return false;
        }
        if task.status == TaskStatus::Complete {
            return false;
        }
        info!(task_id, "map task complete");
        task.status = TaskStatus::Complete;
        true
    }

    fn finish_reducer(&self, worker_idx: usize, task_id: u64) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = st.reducers.get_mut(task_id as usize) else {
            warn!(task_id, "completion report for unknown reduce task");
            return false;
        };
        if task.worker_idx != Some(worker_idx) {
            debug!(task_id, worker_idx, "reduce completion from a non-owner, ignored");
            return false;
        }
        if task.status == TaskStatus::Complete {
            return false;
        }
        info!(task_id, "reduce task complete");
        task.status = TaskStatus::Complete;
        st.unfinished_reducers -= 1;
        if st.unfinished_reducers == 0 {
            // wake the schedule loop so it can observe completion and exit
            self.sched.notify_one();
        }
        true
    }

    /// Declares a worker dead and reclaims its tasks. Completed map tasks are
    /// reclaimed too: their shards lived on the dead worker's disk.
    fn mark_crashed(&self, worker_idx: usize) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let st = &mut *st;
        let worker = &mut st.workers[worker_idx];
        if worker.health == WorkerHealth::Crashed {
            return;
        }
        warn!(worker = %worker.id, "worker declared crashed");
        worker.health = WorkerHealth::Crashed;
        for id in worker.mapper_ids.drain(..) {
            let task = &mut st.mappers[id as usize];
            task.status = TaskStatus::Idle;
            task.old_worker_idx = Some(worker_idx);
            task.worker_idx = None;
        }
        for id in worker.reducer_ids.drain(..) {
            let task = &mut st.reducers[id as usize];
            if task.status == TaskStatus::Complete {
                continue; // output already published to shared storage
            }
            task.status = TaskStatus::Idle;
            task.old_worker_idx = Some(worker_idx);
            task.worker_idx = None;
        }
    }

    async fn notify_loop(self: Arc<Self>) {
        loop {
            if self.done() {
                return;
            }
            let batch = self.notify_batch();
            let mut sends = JoinSet::new();
            for (reducer_worker, mut client, req) in batch {
                sends.spawn(async move {
                    for _ in 0..RPC_MAX_RETRIES {
                        match client.notify(req.clone()).await {
                            Ok(reply) => {
                                if let Err(err) = crate::ensure_ok(&reply.into_inner().s) {
                                    debug!(worker = %reducer_worker, "notify rejected: {err:#}");
                                }
                                return;
                            }
                            Err(err) => debug!(worker = %reducer_worker, "notify rpc failed: {err}"),
                        }
                    }
                });
            }
            while sends.join_next().await.is_some() {}
            tokio::time::sleep(NOTIFY_INTERVAL).await;
        }
    }

    /// Cross product of completed mappers and in-progress reducers. Workers
    /// discard duplicates, so re-sending every cycle is harmless and makes
    /// the repair path just another cycle.
    fn notify_batch(&self) -> Vec<(String, WorkerClient<Channel>, NotifyRequest)> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut batch = Vec::new();
        for mapper in &st.mappers {
            if mapper.status != TaskStatus::Complete {
                continue;
            }
            let Some(new_idx) = mapper.worker_idx else { continue };
            let old_id = mapper
                .old_worker_idx
                .map(|i| st.workers[i].id.clone())
                .unwrap_or_default();
            for (r_idx, reducer) in st.reducers.iter().enumerate() {
                if reducer.status != TaskStatus::InProgress {
                    continue;
                }
                let Some(host) = reducer.worker_idx else { continue };
                let host = &st.workers[host];
                if host.health != WorkerHealth::Healthy {
                    continue;
                }
                batch.push((
                    host.id.clone(),
                    host.client.clone(),
                    NotifyRequest {
                        id: host.id.clone(),
                        task_type: TaskType::Reduce as i32,
                        reduce_task_id: reducer.task_id,
                        old_id: old_id.clone(),
                        new_id: st.workers[new_idx].id.clone(),
                        new_addr: st.workers[new_idx].addr.clone(),
                        new_file_id: mapper.file_id + r_idx as u64,
                        mapper_task_id: mapper.task_id,
                    },
                ));
            }
        }
        batch
    }

    async fn destroy_all(&self) {
        let targets: Vec<(String, WorkerClient<Channel>)> = {
            let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.workers
                .iter()
                .filter(|w| w.health == WorkerHealth::Healthy)
                .map(|w| (w.id.clone(), w.client.clone()))
                .collect()
        };
        let mut sends = JoinSet::new();
        for (id, mut client) in targets {
            sends.spawn(async move {
                for _ in 0..RPC_MAX_RETRIES {
                    match client.destroy(DestroyRequest { id: id.clone() }).await {
                        Ok(_) => return,
                        Err(err) => debug!(worker = %id, "destroy rpc failed: {err}"),
                    }
                }
                warn!(worker = %id, "destroy gave up");
            });
        }
        while sends.join_next().await.is_some() {}
    }
}

/// Least-loaded healthy worker with capacity, first one winning ties.
fn pick_worker(st: &State, cap: usize) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (i, w) in st.workers.iter().enumerate() {
        if w.health != WorkerHealth::Healthy {
            continue;
        }
        let load = st
            .mappers
            .iter()
            .chain(st.reducers.iter())
            .filter(|t| t.worker_idx == Some(i) && t.status == TaskStatus::InProgress)
            .count();
        if best.map_or(true, |(_, b)| load < b) {
            best = Some((i, load));
        }
    }
    match best {
        Some((i, load)) if load < cap => Some(i),
        _ => None,
    }
}

/// gRPC surface of the [`Coordinator`].
pub struct CoordinatorSvc(pub Arc<Coordinator>);

#[tonic::async_trait]
impl CoordinatorRpc for CoordinatorSvc {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterReply>, Status> {
        let req = request.into_inner();
        let s = match self.0.register(req.id, req.addr).await {
            Ok(()) => pb::Status::ok(),
            Err(err) => pb::Status::fail(format!("fail to register: {err:#}")),
        };
        Ok(Response::new(RegisterReply { s }))
    }
}
