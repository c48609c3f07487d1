use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tonic::transport::Server;
use tracing::info;

use minimr::cmd::coordinator::Args;
use minimr::coordinator::{Coordinator, CoordinatorOptions, CoordinatorSvc};
use minimr::pb::coordinator_server::CoordinatorServer;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let local = Path::new(&args.local);
    let log_dir = local.join("coordinator").join("log");
    let result_dir = local.join("result");
    std::fs::create_dir_all(&log_dir)?;
    std::fs::create_dir_all(&result_dir)?;
    minimr::init_logging(&log_dir.join("coordinator.log"))?;

    let mut input_files = Vec::new();
    for entry in glob::glob(&args.input).context("bad input glob")? {
        input_files.push(entry?.display().to_string());
    }
    if input_files.is_empty() {
        bail!("input glob `{}` matched nothing", args.input);
    }
    info!(inputs = input_files.len(), n_reduce = args.n_reduce, "starting job");

    let coordinator = Coordinator::new(CoordinatorOptions {
        input_path: ".".to_string(),
        output_path: result_dir.display().to_string(),
        input_files,
        n_reduce: args.n_reduce,
        max_tasks_per_worker: args.max_tasks,
    })?;

    let svc = CoordinatorServer::new(CoordinatorSvc(coordinator.clone()));
    let addr = format!("127.0.0.1:{}", args.port).parse()?;
    let server = tokio::spawn(Server::builder().add_service(svc).serve(addr));
    info!(%addr, "coordinator listening");

    coordinator.run().await;
    server.abort();
    println!("job complete, output in {}", result_dir.display());
    Ok(())
}
