//! A fault-tolerant distributed MapReduce runtime.
//!
//! One coordinator process hands map and reduce tasks to a pool of worker
//! processes over gRPC, detects crashed workers through heartbeats, and
//! re-routes in-flight reducers to re-executed mappers so that every reduce
//! task observes the complete, sorted output of every map task exactly once.
//! Intermediate data never passes through the coordinator: reducers pull
//! sorted shards directly from the workers that produced them.

use std::hash::Hasher;
use std::path::Path;

use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

pub mod cmd;
pub mod coordinator;
pub mod fs;
pub mod worker;
pub mod workload;

/// Types generated from `proto/mapreduce.proto`.
pub mod pb {
    tonic::include_proto!("mapreduce");
}

pub use pb::KeyValue;

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// A map function takes an input file name and its full contents, and emits
/// a batch of key-value pairs. Keys and values must not contain spaces or
/// newlines; the intermediate format is one `key value` line per pair.
pub type MapFn = fn(filename: &str, contents: &str) -> Vec<KeyValue>;

/// A reduce function takes a key and every value emitted for that key, and
/// returns a single output value.
pub type ReduceFn = fn(key: &str, values: &[String]) -> String;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/// Hashes an intermediate key. Compute a reduce partition for a given key
/// by calculating `ihash(key) % n_reduce`.
pub fn ihash(key: &str) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key.as_bytes());
    (hasher.finish() & 0x7fffffff) as u32
}

/////////////////////////////////////////////////////////////////////////////
// RPC status helpers
/////////////////////////////////////////////////////////////////////////////

impl pb::Status {
    /// A successful reply status, ready to slot into a reply's `s` field.
    pub fn ok() -> Option<Self> {
        Some(Self { ok: true, msg: String::new() })
    }

    /// A rejected reply status carrying a message for the caller's log.
    pub fn fail(msg: impl Into<String>) -> Option<Self> {
        Some(Self { ok: false, msg: msg.into() })
    }
}

/// Turns the application-level status of a reply into a [`Result`].
pub fn ensure_ok(s: &Option<pb::Status>) -> Result<()> {
    match s {
        Some(s) if s.ok => Ok(()),
        Some(s) => bail!("rejected: {}", s.msg),
        None => bail!("reply carried no status"),
    }
}

/// Installs the global tracing subscriber, writing to the given log file.
///
/// Filtered by `RUST_LOG` when set, `info` otherwise.
pub fn init_logging(log_file: &Path) -> Result<()> {
    let file = std::fs::File::create(log_file)?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(file)
        .with_ansi(false)
        .init();
    Ok(())
}
