use std::path::PathBuf;

use clap::Parser;

/// Server configuration, from the command line or the environment
#[derive(Debug, Clone, Parser)]
#[command(
    name = "votechain",
    version,
    about = "Tamper-evident audit ledger for the voting service"
)]
pub struct Config {
    /// Directory holding the ledger database
    #[arg(long, env = "VOTECHAIN_DATA_DIR", default_value = "data/ledger")]
    pub data_dir: PathBuf,

    /// Address to bind the HTTP server to
    #[arg(long, env = "VOTECHAIN_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the HTTP server to
    #[arg(long, env = "VOTECHAIN_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Keep the ledger in memory only; it starts from genesis on every run
    #[arg(long, env = "VOTECHAIN_IN_MEMORY")]
    pub in_memory: bool,
}
