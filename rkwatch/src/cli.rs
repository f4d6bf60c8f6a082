use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkwatch", version, about = "RK8s data watcher CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the data watcher with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
        /// Overrides cluster_id of the config file
        #[arg(long)]
        cluster_id: Option<String>,
    },
}
