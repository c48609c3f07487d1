use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Connect to a coordinator at the given IP address and port
    #[clap(short, long)]
    pub join: String,
    /// Local working directory for shards and logs
    #[clap(short, long, default_value = "output")]
    pub local: String,
    /// Name of the MapReduce application to run
    #[clap(short, long, default_value = "wc")]
    pub workload: String,
    /// Port to listen on (0 picks a free one)
    #[clap(short, long, default_value_t = 0)]
    pub port: u16,
}
