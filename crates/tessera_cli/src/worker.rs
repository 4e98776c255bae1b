//! `tessera worker`: the process `ensure` starts on every core slot.
//!
//! Prints the readiness markers, then fetches its descriptor and items
//! from the coordination server, computes them and returns the values.
//! Nothing may be written to stdout after the markers; logging goes to
//! stderr.

use std::io::Write;

use tessera_config::LOCALHOST;
use tessera_dispatch::{announce_ready, run_worker, WorkerClient};

use crate::fingerprint::NeighborDistances;
use crate::WorkerArgs;

/// Runs the `tessera worker` command.
pub fn run(args: &WorkerArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| LOCALHOST.to_string());
    {
        let mut stdout = std::io::stdout().lock();
        announce_ready(
            &mut stdout,
            &[format!(
                "worker {} on {host} (pid {}) connecting to {}",
                args.id,
                std::process::id(),
                args.server
            )],
        )?;
        stdout.flush()?;
    }

    let client = WorkerClient::new(args.id, args.server.clone());
    let summary = run_worker::<NeighborDistances, _>(&client, Ok)?;
    tracing::debug!(
        id = args.id,
        computed = summary.computed,
        "worker finished in {:.1?}",
        summary.elapsed
    );
    Ok(0)
}
