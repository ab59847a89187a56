use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// rkvol - inspect and edit the CSI volume registry.
#[derive(Parser, Debug)]
#[command(name = "rkvol")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Registry state directory. Defaults to the configured state dir.
    #[arg(long, global = true, value_name = "DIR", env = "RKVOL_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List registered volumes.
    List {
        /// Only volumes in this namespace
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Print the full record of a volume, claims included.
    Info { namespace: String, id: String },
    /// Register or update a volume from a JSON file.
    Register {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Deregister a volume that has no claims.
    Deregister { namespace: String, id: String },
}
