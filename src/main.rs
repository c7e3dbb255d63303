//! SegmentForge: customer segmentation CLI
//!
//! Reads transactions, runs profiling, segmentation and interpretation, then
//! writes tables, models and the control file to the output directory.

use anyhow::{Context, Result};
use clap::Parser;
use segmentforge::{report, Args, Backend, OutputSink, Pipeline, TransactionSource};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    if args.verbose {
        println!("SegmentForge - Customer Segmentation");
        println!("====================================\n");
    }

    if !args.input.exists() {
        anyhow::bail!("Input file not found: {}", args.input.display());
    }

    let config = args.pipeline_config().context("invalid configuration")?;
    let mut store = Backend::Local {
        input: args.input.clone(),
        root: args.output.clone(),
    }
    .open()?;

    let start_time = Instant::now();

    if args.verbose {
        println!("Step 1: Loading transactions");
        println!("  Input file: {}", args.input.display());
    }
    let transactions = store.load_transactions()?;
    println!("✓ Data loaded: {} transaction rows", transactions.height());

    let interpreter = if args.retrain {
        None
    } else {
        store.load_interpreter()?
    };
    if args.verbose {
        println!(
            "  Persisted interpreter: {}",
            if interpreter.is_some() { "found" } else { "none" }
        );
        println!("\nStep 2: Running pipeline");
        println!("  Seed: {}", config.segmenter.seed);
        println!("  Search candidates: {}", config.interpreter.search_iterations);
        println!("  CV folds: {}", config.interpreter.cv_folds);
    }

    let output = Pipeline::new(config)
        .run(&transactions, interpreter)
        .context("segmentation pipeline failed")?;
    println!(
        "✓ Segmented {} customers into {} clusters",
        output.labeled.profile.n_customers(),
        output.k_selected
    );

    if args.verbose {
        println!("\nStep 3: Writing outputs");
        println!("  Output directory: {}", args.output.display());
    }
    store.write(&output)?;
    println!("✓ Outputs written to {}\n", args.output.display());

    report::print_summary(&output, args.verbose)?;

    println!("\n=== Pipeline Complete ===");
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());

    Ok(())
}
