// main.rs

mod ingest;
mod model;
mod output;
mod pca;

use anyhow::{anyhow, Error};
use clap::Parser;
use log::{debug, info};
use std::{path::PathBuf, time::Instant};

fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting expression_pca with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Ingest and join the two input tables ---
    let columns = ingest::MetadataColumns {
        name: cli_args.name_column.clone(),
        cosmic_id: cli_args.cosmic_column.clone(),
        tcga_label: cli_args.label_column.clone(),
    };
    let (schema, cell_lines) = ingest::load(
        &cli_args.metadata,
        &cli_args.expression,
        &columns,
        cli_args.lookup,
    )?;
    info!(
        "Working set: {} cell lines x {} genes.",
        cell_lines.len(),
        schema.len()
    );
    debug!(
        "Gene schema (first 5): {:?}",
        schema.gene_names().iter().take(5).collect::<Vec<_>>()
    );

    if cli_args.components == 0 {
        return Err(anyhow!("Number of components (-k) must be > 0."));
    }

    // --- 2. Run the PCA engine ---
    let run = pca::run_pca(&schema, &cell_lines, cli_args.components)?;
    info!(
        "PCA complete: {} components explain {:.2}% of total variance.",
        run.selected.len(),
        run.cumulative.last().copied().unwrap_or(0.0) * 100.0
    );

    // --- 3. Write outputs ---
    let output_prefix_path = PathBuf::from(&cli_args.output_prefix);
    if let Some(parent) = output_prefix_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow!("Failed to create output directory {}: {}", parent.display(), e)
            })?;
            info!("Created output directory: {}", parent.display());
        }
    }
    info!(
        "Writing results to files with prefix '{}'...",
        cli_args.output_prefix
    );

    output::write_projection(&cli_args.output_prefix, &cell_lines, &run.scores)?;
    output::write_loadings(&cli_args.output_prefix, &schema, &run.loadings)?;
    output::write_variance(&cli_args.output_prefix, &run)?;
    output::write_targets(&cli_args.output_prefix, &model::targets(&cell_lines))?;

    info!(
        "expression_pca finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

mod cli {
    use clap::Parser;
    use std::path::PathBuf;

    use crate::ingest::LookupKey;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "PCA over RMA gene-expression of cancer cell lines.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Tab-separated cell-line metadata table.
        #[arg(short = 'm', long, required = true)]
        pub(crate) metadata: PathBuf,

        /// Tab-separated gene-major RMA expression table.
        #[arg(short = 'e', long, required = true)]
        pub(crate) expression: PathBuf,

        #[arg(short = 'o', long = "out", required = true)]
        pub(crate) output_prefix: String,

        /// Number of principal components to keep.
        #[arg(short = 'k', long, default_value_t = 3)]
        pub(crate) components: usize,

        /// Identifier joining metadata rows to expression columns.
        #[arg(long, value_enum, default_value_t = LookupKey::CosmicId)]
        pub(crate) lookup: LookupKey,

        #[arg(long, default_value = "Name")]
        pub(crate) name_column: String,

        #[arg(long, default_value = "COSMIC_ID")]
        pub(crate) cosmic_column: String,

        #[arg(long, default_value = "Tissue sub-type")]
        pub(crate) label_column: String,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}
