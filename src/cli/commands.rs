//! CLI commands

use crate::core::aggregate::FoldPolicy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Food truck ratings CLI
#[derive(Parser, Debug)]
#[command(name = "truck-ratings")]
#[command(about = "Per-truck rating aggregates kept current by a write trigger")]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the rating WAL (overrides the configuration)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// How an overwritten rating is folded into the average
    #[arg(long, global = true)]
    pub fold_policy: Option<FoldPolicy>,

    /// Skip redelivered writes instead of counting them again
    #[arg(long, global = true)]
    pub dedup: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit one rating and print the updated aggregate
    Rate {
        /// Entity (truck) ID
        #[arg(short, long)]
        entity: String,
        /// Rater ID
        #[arg(short, long)]
        rater: String,
        /// Rating value
        #[arg(short, long)]
        value: f64,
    },
    /// Print aggregates
    Show {
        /// Only this entity
        #[arg(short, long)]
        entity: Option<String>,
    },
    /// Print the individual ratings of one entity
    Ratings {
        /// Entity (truck) ID
        #[arg(short, long)]
        entity: String,
    },
    /// Feed document-change payloads, one JSON object per line, to the trigger
    Replay {
        /// File of change payloads
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Rate one entity from many concurrent raters
    Simulate {
        /// Entity (truck) ID
        #[arg(short, long)]
        entity: String,
        /// Number of raters
        #[arg(short, long, default_value = "100")]
        raters: u32,
    },
}
