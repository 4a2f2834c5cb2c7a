// genotrack: clusters longitudinal allele-frequency trajectories into
// genotypes and orders them into a lineage tree

const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::error::Error;
use std::io::{BufWriter, Write};

use clap::{Parser, Subcommand};

mod cluster;
mod error;
mod filter;
mod genotype;
mod order;
mod pairwise;
mod pipeline;
mod progress;
mod refine;
mod similarity;
mod trajectory;

/// Logger writing timestamped lines to an optional run log
pub struct Logger {
    writer: BufWriter<std::fs::File>,
}

impl Logger {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }

    /// Record detailed log information
    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.writer, "[{}] {}", timestamp, message)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster trajectories into genotypes
    Cluster(pipeline::ClusterArgs),
    /// Full pipeline: cluster, filter, and order genotypes into a lineage tree
    Lineage(pipeline::LineageArgs),
    /// Order an existing genotype table into a lineage tree
    Order(order::OrderArgs),
}

/// Configure the global rayon pool when a thread count was requested
fn configure_threads(threads: Option<usize>) {
    if let Some(threads) = threads {
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global();
    }
}

/// Open the optional run log and record the invocation header
fn open_log(path: &Option<String>, command: &str) -> std::io::Result<Option<Logger>> {
    match path {
        Some(path) => {
            let mut logger = Logger::new(std::fs::File::create(path)?);
            logger.log(&format!("genotrack v{} {}", VERSION, command))?;
            Ok(Some(logger))
        }
        None => Ok(None),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Cluster(args) => {
            pipeline::validate_cluster_args(&args)?;
            configure_threads(args.threads);
            let mut logger = open_log(&args.log, "cluster")?;
            if let Some(logger) = logger.as_mut() {
                logger.log(&format!("input: {}", args.input))?;
            }
            pipeline::cluster_main(&args)?;
            if let Some(logger) = logger.as_mut() {
                logger.log(&format!("wrote genotype table: {}", args.output))?;
            }
        }
        Commands::Lineage(args) => {
            pipeline::validate_lineage_args(&args)?;
            configure_threads(args.threads);
            let mut logger = open_log(&args.log, "lineage")?;
            if let Some(logger) = logger.as_mut() {
                logger.log(&format!("input: {}", args.input))?;
            }
            pipeline::lineage_main(&args)?;
            if let Some(logger) = logger.as_mut() {
                logger.log(&format!(
                    "wrote genotype table: {} and edges: {}",
                    args.output, args.edges
                ))?;
            }
        }
        Commands::Order(args) => {
            order::validate_order_args(&args)?;
            order::order_main(&args)?;
        }
    }

    Ok(())
}
