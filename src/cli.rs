//! Command-line surface for the demo binary. Ambient wiring, not part of
//! the ingest core (spec §1 "CLI wrappers... out of scope for the core").

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "bulkloader", about = "Partition-sharded bulk ingest demo")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config/ingest.toml")]
    pub config: String,

    /// Rows to insert into the demo MP table before draining.
    #[arg(long, default_value_t = 12)]
    pub rows: usize,

    /// Run the scripted connection-loss demo scenario instead of the happy path.
    #[arg(long, default_value_t = false)]
    pub simulate_connection_loss: bool,

    /// Tokio worker threads.
    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}
