use std::path::Path;

use anyhow::Result;
use clap::Parser;

use minimr::cmd::worker::Args;
use minimr::worker::Worker;
use minimr::workload;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let workload = workload::named(&args.workload)?;
    let worker = Worker::init(Path::new(&args.local), workload)?;
    minimr::init_logging(&worker.local_dir().join("log").join("worker.log"))?;

    let (addr, _server) = worker.serve(args.port).await?;
    worker.register(&args.join, addr).await?;
    worker.wait().await;
    Ok(())
}
