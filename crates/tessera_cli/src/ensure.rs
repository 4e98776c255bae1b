//! `tessera ensure`: fill the store for an item file.
//!
//! 1. Load configuration and read the items
//! 2. Work out the core allocation and, when distributing, the worker command
//! 3. Hash, find what the store lacks and compute it
//! 4. Report duplicates and what was written

use std::time::Duration;

use tessera_dispatch::CancelToken;
use tessera_engine::{CacheOrchestrator, EnsureMode, EnsureReport, Parallelism};

use crate::context::Context;
use crate::fingerprint::NeighborDistances;
use crate::items::read_items;
use crate::{EnsureArgs, GlobalArgs};

/// Runs the `tessera ensure` command.
///
/// Returns exit code 0 once every item has a record.
pub fn run(args: &EnsureArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let context = Context::load(global)?;
    let items = read_items(&args.items)?;
    let compute = NeighborDistances::new(args.cutoff.unwrap_or(context.config.descriptor.cutoff))?;

    let assignment = context.cores(args.cores)?;
    tracing::info!("Cores ({}): {}", assignment.source, assignment.cores);
    let worker_command = if assignment.cores.total() > 1 {
        Some(context.worker_command(args.worker_command.as_deref())?)
    } else {
        None
    };
    let mut parallelism =
        Parallelism::from_config(assignment.cores, worker_command, &context.config.parallel);
    if let Some(secs) = args.worker_timeout {
        parallelism.worker_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())?;

    let store = context.open_store()?;
    let mut orchestrator = CacheOrchestrator::new(compute, store).with_cancel(cancel);
    let report = orchestrator.ensure(items.into_iter().map(|(_, s)| s), &parallelism)?;

    if !global.quiet {
        print_report(&report, global.verbose);
        eprintln!(
            "    Finished {} in {:.1}s",
            orchestrator.store().path().display(),
            report.elapsed.as_secs_f64()
        );
    }
    Ok(0)
}

fn describe(mode: EnsureMode) -> String {
    match mode {
        EnsureMode::UpToDate => "up to date".to_string(),
        EnsureMode::Serial => "computed serially".to_string(),
        EnsureMode::Distributed { workers } => format!("computed by {workers} workers"),
    }
}

fn print_report(report: &EnsureReport, verbose: bool) {
    if !report.duplicates.is_empty() {
        eprintln!(
            "warning: {} duplicate items in input",
            report.duplicates.total()
        );
        if verbose {
            for (key, repeats) in report.duplicates.iter() {
                eprintln!("  {key} repeated {repeats}x");
            }
        }
    }
    eprintln!(
        "     Ensured {} fingerprints: {} stored, {} written ({})",
        report.keys.len(),
        report.already_stored,
        report.written,
        describe(report.mode)
    );
}
