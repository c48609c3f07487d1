//! Per-assignment task executor.
//!
//! A [`Task`] owns either a map pipeline (read input, run the user map
//! function, sort, partition into pre-opened shard files) or a reduce
//! pipeline (merge every mapper's shard for this partition, run the user
//! reduce function per key group, publish the output atomically). Reduce
//! tasks are fed their shard readers by `Notify` calls and survive producer
//! crashes by waiting for a replacement reader instead of failing.

use std::io::{BufWriter, Read, Write};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fs::{self, FileHandle, FileSystem, Perm};
use crate::pb::{TaskStatus, TaskType};
use crate::worker::iterator::{IntermediateKVIterator, KVReader, MergeIterator};
use crate::{ihash, MapFn, ReduceFn};

/// What a task executes, with the parameters only that side needs.
pub enum TaskSpec {
    Map {
        input_path: String,
        input_files: Vec<String>,
        /// Directory receiving the intermediate shard files.
        local_path: String,
        total_reduce: usize,
        map_fn: MapFn,
    },
    Reduce {
        output_path: String,
        total_map: usize,
        reduce_fn: ReduceFn,
    },
}

pub struct TaskParams {
    pub task_id: u64,
    pub file_id: u64,
    pub worker_id: String,
    pub spec: TaskSpec,
}

impl TaskParams {
    pub fn task_type(&self) -> TaskType {
        match self.spec {
            TaskSpec::Map { .. } => TaskType::Map,
            TaskSpec::Reduce { .. } => TaskType::Reduce,
        }
    }
}

/// One expected input shard of a reduce task: the most recently notified
/// producer and, until the executor takes it, a reader bound to it. `epoch`
/// advances on every rebinding so the executor can tell a repaired slot from
/// one it has already consumed.
struct ReaderSlot {
    producer: String,
    reader: Option<Box<dyn KVReader>>,
    epoch: u64,
}

struct TaskState {
    status: TaskStatus,
    slots: Vec<ReaderSlot>,
    /// Slots bound at least once; the reduce pipeline starts at `total_map`.
    ready: usize,
}

pub struct Task {
    params: TaskParams,
    state: Mutex<TaskState>,
    wake: Notify,
    /// Pre-opened output handles: one per partition for map, the staging
    /// file for reduce. Taken by the executor.
    files: Mutex<Vec<Box<dyn FileHandle>>>,
    gfs: Arc<dyn FileSystem>,
    tmp_name: String,
}

impl Task {
    /// Builds a task and eagerly opens its output files, so an assignment
    /// over a broken filesystem fails at `Assign` time rather than later.
    pub fn new(params: TaskParams) -> Result<Arc<Self>> {
        let mut files: Vec<Box<dyn FileHandle>> = Vec::new();
        let mut slots = Vec::new();
        let mut tmp_name = String::new();
        let gfs = match &params.spec {
            TaskSpec::Map { input_path, local_path, total_reduce, .. } => {
                let gfs = fs::from_url(&format!("local://{input_path}"))?;
                let local = fs::from_url(&format!("local://{local_path}"))?;
                for p in 0..*total_reduce {
                    files.push(local.open(&shard_name(params.file_id + p as u64), Perm::Write)?);
                }
                gfs
            }
            TaskSpec::Reduce { output_path, total_map, .. } => {
                let gfs = fs::from_url(&format!("local://{output_path}"))?;
                tmp_name = format!("{}-{}.tmp", params.worker_id, params.file_id);
                files.push(gfs.open(&tmp_name, Perm::Write)?);
                for _ in 0..*total_map {
                    slots.push(ReaderSlot { producer: String::new(), reader: None, epoch: 0 });
                }
                gfs
            }
        };
        Ok(Arc::new(Self {
            params,
            state: Mutex::new(TaskState { status: TaskStatus::Idle, slots, ready: 0 }),
            wake: Notify::new(),
            files: Mutex::new(files),
            gfs,
            tmp_name,
        }))
    }

    /// Flips the task to InProgress and spawns its executor.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.status != TaskStatus::Idle {
                bail!("task has started");
            }
            st.status = TaskStatus::InProgress;
        }
        let task = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let result = match task.params.spec {
                // The map pipeline is synchronous file I/O plus a sort; keep
                // it off the runtime threads serving Heartbeat and Read.
                TaskSpec::Map { .. } => {
                    let mapper = Arc::clone(&task);
                    match tokio::task::spawn_blocking(move || mapper.run_map()).await {
                        Ok(result) => result,
                        Err(err) => Err(anyhow::anyhow!("map executor aborted: {err}")),
                    }
                }
                TaskSpec::Reduce { .. } => task.run_reduce().await,
            };
            let status = match result {
                Ok(()) => TaskStatus::Complete,
                Err(err) => {
                    warn!(
                        task_id = task.params.task_id,
                        "task failed: {err:#}"
                    );
                    TaskStatus::Error
                }
            };
            let mut st = task.state.lock().unwrap_or_else(|e| e.into_inner());
            st.status = status;
            info!(task_id = task.params.task_id, ?status, "task finished");
        }))
    }

    pub fn info(&self) -> (TaskType, u64, TaskStatus) {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (self.params.task_type(), self.params.task_id, st.status)
    }

    /// Handles a producer notification for a reduce task.
    ///
    /// The first notification for a shard binds its reader; a later one whose
    /// `old_id` matches the current binding substitutes it (the original
    /// producer crashed and the map task ran elsewhere). Duplicates and stale
    /// notifications are ignored.
    pub fn notify(
        &self,
        mapper_task_id: u64,
        old_id: &str,
        new_id: &str,
        reader: Box<dyn KVReader>,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let reduce_task = self.params.task_id;
        let Some(slot) = st.slots.get_mut(mapper_task_id as usize) else {
            bail!("invalid mapper task id {mapper_task_id}");
        };
        if slot.producer == new_id {
            debug!(reduce_task, mapper_task_id, "duplicate notify, ignored");
            return Ok(());
        }
        if slot.producer.is_empty() {
            info!(reduce_task, mapper_task_id, producer = new_id, "shard reader bound");
            slot.producer = new_id.to_string();
            slot.reader = Some(reader);
            slot.epoch += 1;
            st.ready += 1;
            self.wake.notify_one();
        } else if slot.producer == old_id {
            info!(
                reduce_task,
                mapper_task_id,
                old = old_id,
                new = new_id,
                "shard producer substituted"
            );
            slot.producer = new_id.to_string();
            slot.reader = Some(reader);
            slot.epoch += 1;
            self.wake.notify_one();
        } else {
            debug!(
                reduce_task,
                mapper_task_id,
                bound = %slot.producer,
                old = old_id,
                "stale notify, ignored"
            );
        }
        Ok(())
    }

    fn run_map(&self) -> Result<()> {
        let TaskSpec::Map { input_files, total_reduce, map_fn, .. } = &self.params.spec else {
            bail!("not a map task");
        };
        info!(task_id = self.params.task_id, inputs = input_files.len(), "mapper started");
        let files = std::mem::take(&mut *self.files.lock().unwrap_or_else(|e| e.into_inner()));
        let mut outs: Vec<BufWriter<_>> = files.into_iter().map(BufWriter::new).collect();
        for fname in input_files {
            let mut fh = self.gfs.open(fname, Perm::Read)?;
            let mut content = String::new();
            fh.read_to_string(&mut content).with_context(|| format!("read {fname}"))?;
            // Each shard must be individually sorted: the reducer's paginated
            // range scan depends on it.
            let kvs = map_fn(fname, &content)
                .into_iter()
                .sorted_by(|a, b| a.key.cmp(&b.key));
            for kv in kvs {
                let part = ihash(&kv.key) as usize % total_reduce;
                writeln!(outs[part], "{} {}", kv.key, kv.value)?;
            }
        }
        for out in &mut outs {
            out.flush()?;
        }
        Ok(())
    }

    async fn run_reduce(&self) -> Result<()> {
        let result = self.do_reduce().await;
        if result.is_err() {
            // discard the staging file, nothing was published
            let _ = self.gfs.unlink(&self.tmp_name);
        }
        result
    }

    async fn do_reduce(&self) -> Result<()> {
        let TaskSpec::Reduce { total_map, reduce_fn, .. } = &self.params.spec else {
            bail!("not a reduce task");
        };
        // Wait until every expected shard has a producer.
        loop {
            let notified = self.wake.notified();
            {
                let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if st.ready == *total_map {
                    break;
                }
            }
            notified.await;
        }
        info!(task_id = self.params.task_id, "reducer started");
        let mut epochs = Vec::with_capacity(*total_map);
        let mut iters = Vec::with_capacity(*total_map);
        {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            for slot in st.slots.iter_mut() {
                let reader = slot.reader.take().context("shard reader vanished")?;
                epochs.push(slot.epoch);
                iters.push(IntermediateKVIterator::new(reader));
            }
        }
        let mut merge = MergeIterator::new(iters);

        let staged = {
            let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
            files.pop().context("staging file vanished")?
        };
        let mut out = BufWriter::new(staged);
        let mut current_key: Option<String> = None;
        let mut values: Vec<String> = Vec::new();
        loop {
            match merge.next().await {
                Ok(true) => {
                    let kv = merge.get();
                    // grouping consecutive equal keys is correct only because
                    // the merge guarantees global sort order
                    if current_key.as_deref() == Some(kv.key.as_str()) {
                        values.push(kv.value.clone());
                    } else {
                        if let Some(key) = current_key.take() {
                            writeln!(out, "{} {}", key, reduce_fn(&key, &values))?;
                        }
                        current_key = Some(kv.key.clone());
                        values.clear();
                        values.push(kv.value.clone());
                    }
                }
                Ok(false) => {
                    if let Some(key) = current_key.take() {
                        writeln!(out, "{} {}", key, reduce_fn(&key, &values))?;
                    }
                    break;
                }
                Err(err) => {
                    // A broken reader is repaired by a Notify naming the
                    // re-executed mapper's new host; block until then and
                    // retry the same step.
                    warn!(
                        task_id = self.params.task_id,
                        "intermediate read failed, waiting for a new producer: {err:#}"
                    );
                    loop {
                        let notified = self.wake.notified();
                        if self.swap_repaired_readers(&mut merge, &mut epochs) {
                            break;
                        }
                        notified.await;
                    }
                }
            }
        }
        out.flush()?;
        drop(out);
        self.gfs.rename(&self.tmp_name, &format!("mr-out-{}", self.params.file_id))?;
        Ok(())
    }

    /// Moves any repaired reader bindings into the merge. Returns whether a
    /// substitution happened.
    fn swap_repaired_readers(&self, merge: &mut MergeIterator, epochs: &mut [u64]) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut swapped = false;
        for (i, slot) in st.slots.iter_mut().enumerate() {
            if slot.epoch != epochs[i] {
                if let Some(reader) = slot.reader.take() {
                    merge.set(i, reader);
                    epochs[i] = slot.epoch;
                    swapped = true;
                }
            }
        }
        swapped
    }
}

fn shard_name(file_id: u64) -> String {
    format!("map-{file_id}")
}
