//! Streaming, restartable iteration over remote intermediate shards.
//!
//! Each mapper leaves one sorted shard per reduce partition on its own disk.
//! A reducer pulls every shard through paginated `Read` RPCs and merges them
//! into one globally sorted sequence. Because the cursor into a shard is
//! logical (`(last_key, offset)` rather than a byte position), a reader can
//! be substituted mid-stream with one pointing at a different worker and the
//! scan resumes at the same record. That is what lets a reduce task survive
//! the crash of a mapper it is still consuming.

use std::cmp::Ordering;
use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tonic::transport::Channel;

use crate::pb::worker_client::WorkerClient;
use crate::pb::{KeyValue, ReadRequest};

/// Records fetched per `Read` RPC.
pub const READ_BATCH: usize = 1024;

/// Bounded retries for transport-level RPC failures. Application-level
/// rejections are never retried.
pub const RPC_MAX_RETRIES: usize = 3;

/// A paginated source of sorted key-value records.
#[async_trait]
pub trait KVReader: Send {
    /// Returns up to `n` records positioned after the `(last_key, offset)`
    /// cursor: records whose key is greater than `last_key`, or equal to it
    /// with more than `offset` earlier duplicates already consumed. A short
    /// page means end of shard.
    async fn read(&mut self, last_key: &str, offset: u64, n: usize) -> Result<Vec<KeyValue>>;
}

/// A [`KVReader`] backed by a remote worker's `Read` RPC.
pub struct RemoteKVReader {
    client: WorkerClient<Channel>,
    worker_id: String,
    file_id: u64,
}

impl RemoteKVReader {
    pub fn new(client: WorkerClient<Channel>, worker_id: impl Into<String>, file_id: u64) -> Self {
        Self { client, worker_id: worker_id.into(), file_id }
    }
}

#[async_trait]
impl KVReader for RemoteKVReader {
    async fn read(&mut self, last_key: &str, offset: u64, n: usize) -> Result<Vec<KeyValue>> {
        let req = ReadRequest {
            id: self.worker_id.clone(),
            file_id: self.file_id,
            last_key: last_key.to_string(),
            offset,
            max_count: n as u32,
        };
        let mut last_err = anyhow!("read not attempted");
        for _ in 0..RPC_MAX_RETRIES {
            match self.client.read(req.clone()).await {
                Ok(resp) => {
                    let reply = resp.into_inner();
                    crate::ensure_ok(&reply.s)
                        .map_err(|e| anyhow!("worker[{}] refused read: {e}", self.worker_id))?;
                    return Ok(reply.kvs);
                }
                Err(status) => last_err = anyhow!("read from worker[{}]: {status}", self.worker_id),
            }
        }
        Err(last_err)
    }
}

/// Sorted iteration over a single shard with a local read-ahead buffer.
///
/// `next` advances to the following record and returns `Ok(false)` once the
/// shard is exhausted; callers must call [`get`](Self::get) only immediately
/// after `next` returned `Ok(true)`. An `Err` is transient: once the reader
/// has been repaired via [`set_reader`](Self::set_reader), calling `next`
/// again resumes at the exact record the failed call was about to fetch.
pub struct IntermediateKVIterator {
    reader: Box<dyn KVReader>,
    buf: VecDeque<KeyValue>,
    last_key: String,
    offset: u64,
    batch: usize,
    eof: bool,
}

impl IntermediateKVIterator {
    pub fn new(reader: Box<dyn KVReader>) -> Self {
        Self::with_batch(reader, READ_BATCH)
    }

    pub fn with_batch(reader: Box<dyn KVReader>, batch: usize) -> Self {
        Self { reader, buf: VecDeque::new(), last_key: String::new(), offset: 0, batch, eof: false }
    }

    pub async fn next(&mut self) -> Result<bool> {
        loop {
            if self.buf.is_empty() {
                if self.eof {
                    return Ok(false);
                }
                let page = self.reader.read(&self.last_key, self.offset, self.batch).await?;
                if page.len() < self.batch {
                    self.eof = true;
                }
                if page.is_empty() {
                    return Ok(false);
                }
                self.buf.extend(page);
                return Ok(true);
            }
            // Fold the record being consumed into the cursor. `offset` counts
            // how many records with key == last_key have been consumed, which
            // is what disambiguates duplicate keys at page boundaries.
            if let Some(head) = self.buf.pop_front() {
                if head.key != self.last_key {
                    self.last_key = head.key;
                    self.offset = 0;
                }
                self.offset += 1;
            }
            if !self.buf.is_empty() {
                return Ok(true);
            }
        }
    }

    /// The record `next` stopped on. Panics if the iterator is not positioned
    /// on a record.
    pub fn get(&self) -> &KeyValue {
        &self.buf[0]
    }

    /// Substitutes the underlying reader without moving the cursor.
    pub fn set_reader(&mut self, reader: Box<dyn KVReader>) {
        self.reader = reader;
    }
}

/// Comparator injected for non-lexicographic key ordering.
pub type KeyComparator = fn(&str, &str) -> Ordering;

/// K-way merge over per-mapper iterators, yielding a globally sorted stream.
///
/// The heap is an explicit index-addressable array of sub-iterator indices
/// ordered by current head key, ties broken by index for determinism.
/// [`set`](Self::set) swaps the reader feeding a sub-iterator without
/// disturbing heap membership, so a repair can happen while a merge is in
/// flight; the substituted reader is first consulted on the next advance.
pub struct MergeIterator {
    iters: Vec<IntermediateKVIterator>,
    heap: Vec<usize>,
    cmp: Option<KeyComparator>,
    first: bool,
    init_pos: usize,
}

impl MergeIterator {
    pub fn new(iters: Vec<IntermediateKVIterator>) -> Self {
        Self { iters, heap: Vec::new(), cmp: None, first: true, init_pos: 0 }
    }

    pub fn with_comparator(iters: Vec<IntermediateKVIterator>, cmp: KeyComparator) -> Self {
        Self { iters, heap: Vec::new(), cmp: Some(cmp), first: true, init_pos: 0 }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let lhs = &self.iters[a].get().key;
        let rhs = &self.iters[b].get().key;
        let ord = match self.cmp {
            Some(cmp) => cmp(lhs, rhs),
            None => lhs.cmp(rhs),
        };
        match ord {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => a < b,
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(self.heap[i], self.heap[parent]) {
                break;
            }
            self.heap.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut min = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.heap.len() && self.less(self.heap[child], self.heap[min]) {
                    min = child;
                }
            }
            if min == i {
                break;
            }
            self.heap.swap(i, min);
            i = min;
        }
    }

    fn push(&mut self, idx: usize) {
        self.heap.push(idx);
        self.sift_up(self.heap.len() - 1);
    }

    /// Advances to the next record in global key order.
    ///
    /// Transient sub-iterator errors leave the merge state untouched, so the
    /// caller can repair the affected reader with [`set`](Self::set) and call
    /// `next` again without losing or duplicating records.
    pub async fn next(&mut self) -> Result<bool> {
        if self.first {
            // Resumable priming: on error, pick up at the same sub-iterator.
            while self.init_pos < self.iters.len() {
                let i = self.init_pos;
                if self.iters[i].next().await? {
                    self.push(i);
                }
                self.init_pos += 1;
            }
            self.first = false;
            return Ok(!self.heap.is_empty());
        }
        if self.heap.is_empty() {
            return Ok(false);
        }
        // Consume the exposed minimum by advancing its sub-iterator in place.
        let x = self.heap[0];
        if self.iters[x].next().await? {
            self.sift_down(0);
        } else if let Some(last) = self.heap.pop() {
            if !self.heap.is_empty() {
                self.heap[0] = last;
                self.sift_down(0);
            }
        }
        Ok(!self.heap.is_empty())
    }

    /// The record `next` stopped on. Panics if the merge is exhausted or has
    /// not been advanced.
    pub fn get(&self) -> &KeyValue {
        self.iters[self.heap[0]].get()
    }

    /// Substitutes the reader feeding sub-iterator `seq`.
    pub fn set(&mut self, seq: usize, reader: Box<dyn KVReader>) {
        self.iters[seq].set_reader(reader);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::bail;

    /// In-memory [`KVReader`] over a sorted record list, answering cursor
    /// queries with the same scan rule the worker's `Read` handler uses.
    pub struct DummyKVReader {
        pub kvs: Vec<KeyValue>,
    }

    impl DummyKVReader {
        pub fn new(kvs: Vec<KeyValue>) -> Self {
            Self { kvs }
        }
    }

    pub fn scan(kvs: &[KeyValue], last_key: &str, offset: u64, n: usize) -> Vec<KeyValue> {
        let mut seen = 0u64;
        let mut out = Vec::new();
        for kv in kvs {
            if kv.key == last_key {
                seen += 1;
            }
            if seen > offset || kv.key.as_str() > last_key {
                out.push(kv.clone());
                if out.len() == n {
                    break;
                }
            }
        }
        out
    }

    #[async_trait]
    impl KVReader for DummyKVReader {
        async fn read(&mut self, last_key: &str, offset: u64, n: usize) -> Result<Vec<KeyValue>> {
            Ok(scan(&self.kvs, last_key, offset, n))
        }
    }

    /// Serves records until its quota runs out, then fails every read,
    /// standing in for a producer that crashed mid-scan.
    pub struct FlakyKVReader {
        pub kvs: Vec<KeyValue>,
        pub remaining: usize,
    }

    #[async_trait]
    impl KVReader for FlakyKVReader {
        async fn read(&mut self, last_key: &str, offset: u64, n: usize) -> Result<Vec<KeyValue>> {
            // Never hand out a short page because of the quota: a short page
            // reads as end-of-shard. Fail outright instead.
            if self.remaining < n {
                bail!("producer is gone");
            }
            let page = scan(&self.kvs, last_key, offset, n);
            self.remaining -= page.len();
            Ok(page)
        }
    }

    pub fn kv(key: &str, value: &str) -> KeyValue {
        KeyValue { key: key.to_string(), value: value.to_string() }
    }

    /// A sorted list of `n` records with duplicate keys, numbered values.
    pub fn sorted_records(seed: u64, n: usize) -> Vec<KeyValue> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let mut key = 0u64;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            // step 0..3 so runs of equal keys are common
            key += (state >> 33) % 4;
            out.push(kv(&format!("{key:06}"), &format!("v{i}")));
        }
        out
    }
}
