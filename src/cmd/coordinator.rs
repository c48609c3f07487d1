use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Glob of input files to process
    #[clap(short, long)]
    pub input: String,
    /// Local working directory for logs and job output
    #[clap(short, long, default_value = "output")]
    pub local: String,
    /// Number of reduce tasks (output partitions)
    #[clap(short, long, default_value_t = 8)]
    pub n_reduce: usize,
    /// Maximum concurrently running tasks per worker
    #[clap(short, long, default_value_t = 2)]
    pub max_tasks: usize,
    /// Port to listen on
    #[clap(short, long, default_value_t = 50051)]
    pub port: u16,
}
