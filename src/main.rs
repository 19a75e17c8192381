use std::ffi::OsString;
use std::process::ExitCode;

use clap::Parser;

use log::error;

use rayon::prelude::*;

use stepgraph::backend::analyze;
use stepgraph::config::Config;
use stepgraph::error::Condition;
use stepgraph::pipeline::{build_trace, LogProgress};
use stepgraph::serialize::deserialize;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(required = true, help = "input trace record filenames (.json or .json.gz)")]
    filenames: Vec<OsString>,

    #[arg(short, long, help = "JSON configuration file")]
    config: Option<OsString>,

    #[arg(
        long = "leap",
        help = "step partitions together when their leaps differ by less than this"
    )]
    leap_threshold: Option<u64>,

    #[arg(
        long = "no-split-phases",
        help = "join adjacent communication events even across phase boundaries"
    )]
    no_split_phases: bool,

    #[arg(
        long = "isend-coalescing",
        help = "merge consecutive sends of a process into one event"
    )]
    isend_coalescing: bool,

    #[arg(
        long = "waitall-merge",
        help = "merge consecutive receives of a process into one event"
    )]
    waitall_merge: bool,

    #[arg(
        short,
        long = "metric",
        help = "base metric to compute a differential for (repeatable)"
    )]
    metrics: Vec<String>,

    #[arg(short, long, help = "print verbose build information")]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Unable to load config {:?}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    if let Some(leap) = cli.leap_threshold {
        config.leap_threshold = leap;
    }
    if cli.no_split_phases {
        config.split_phases = false;
    }
    config.isend_coalescing |= cli.isend_coalescing;
    config.waitall_merge |= cli.waitall_merge;
    if !cli.metrics.is_empty() {
        config.differential_metrics = cli.metrics.clone();
    }
    config.verbose |= cli.verbose;

    let level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let results: Vec<_> = cli
        .filenames
        .par_iter()
        .map(|filename| {
            println!("Reading trace file {:?}...", filename);
            let records = match deserialize(filename) {
                Ok(records) => records,
                Err(e) => {
                    error!("{:?}: {}", filename, e);
                    return None;
                }
            };
            println!("Matched {} objects", records.len());
            match build_trace(&records, &config, &mut LogProgress) {
                Ok(built) => Some(built),
                Err(e) => {
                    match e.condition() {
                        Condition::NoPartitions => println!("No communication phases found"),
                        condition => error!("{:?}: {}: {}", filename, condition, e),
                    }
                    None
                }
            }
        })
        .collect();

    let mut ok = true;
    for (filename, result) in cli.filenames.iter().zip(results) {
        match result {
            Some((trace, summary)) => {
                println!();
                println!("Statistics for {:?}", filename);
                analyze::print_statistics(&trace, &summary);
            }
            None => ok = false,
        }
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
