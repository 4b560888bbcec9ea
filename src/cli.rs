use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "diagnostic-learning")]
#[command(version)]
#[command(about = "Self-learning diagnostic engine: learn from fix attempts, recommend fixes, score confidence")]
pub struct Args {
    /// SQLite database holding the learned state
    #[arg(long, global = true, default_value = "diagnostic-learning.db")]
    pub db: PathBuf,

    /// Optional TOML file overriding caps and thresholds
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print JSON instead of colored text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Learn from a JSON-lines file of fix attempts
    Ingest {
        /// One attempt object per line
        file: PathBuf,
        /// Keep superseded rows instead of compacting the database afterwards
        #[arg(long)]
        no_compact: bool,
    },
    /// Run one scoring cycle and print the confidence report
    Report,
    /// Recommend a fix for an issue type
    Best {
        issue_type: String,
    },
    /// Show misdiagnosis warnings for a situation about to be diagnosed
    Prevent {
        issue_type: String,
        error_message: String,
        #[arg(long)]
        component: Option<String>,
    },
    /// Run the background confidence monitor until Ctrl-C
    Monitor {
        /// Seconds between scoring cycles (defaults to the config value)
        #[arg(long)]
        interval: Option<u64>,
    },
}
