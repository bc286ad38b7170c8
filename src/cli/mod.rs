pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "nwpdcli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Query the observation history of a network problem detector agent", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(
        short,
        long,
        global = true,
        default_value = "localhost:8880",
        help = "Agent address (host:port)"
    )]
    pub agent: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "List raw observations")]
    Observations {
        #[command(flatten)]
        filter: QueryFilter,
    },
    #[command(about = "List observations aggregated per edge and time window")]
    Aggregated {
        #[command(flatten)]
        filter: QueryFilter,

        #[arg(
            short,
            long,
            value_parser = nwpd_common::duration::parse_duration,
            help = "Aggregation window (e.g. 5m), at least 30s"
        )]
        window: Option<Duration>,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct QueryFilter {
    #[arg(short, long, help = "Restrict to job id(s)")]
    pub job: Vec<String>,

    #[arg(short, long, help = "Restrict to source host(s)")]
    pub src: Vec<String>,

    #[arg(short, long, help = "Restrict to destination host(s)")]
    pub dest: Vec<String>,

    #[arg(short, long, help = "Only show failed observations")]
    pub failures_only: bool,

    #[arg(
        long,
        value_parser = nwpd_common::duration::parse_duration,
        help = "Only show observations newer than this (e.g. 30m)"
    )]
    pub since: Option<Duration>,

    #[arg(short, long, default_value = "0", help = "Maximum number of observations, 0 for all")]
    pub limit: i32,
}
