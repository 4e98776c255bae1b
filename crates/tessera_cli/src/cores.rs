//! `tessera cores`: show the core allocation `ensure` would use.

use crate::context::Context;
use crate::GlobalArgs;

/// Runs the `tessera cores` command.
pub fn run(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let context = Context::load(global)?;
    let assignment = context.cores(None)?;
    println!("{}", assignment.cores);
    if !global.quiet {
        eprintln!(
            "{} cores on {} hosts ({})",
            assignment.cores.total(),
            assignment.cores.len(),
            assignment.source
        );
    }
    Ok(0)
}
