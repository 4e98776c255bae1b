//! Store maintenance and inspection: `compact`, `keys` and `show`.

use tessera_common::CacheKey;
use tessera_store::CompactionReport;

use crate::context::Context;
use crate::GlobalArgs;

type Fingerprint = Vec<Vec<f64>>;

/// Runs the `tessera compact` command.
pub fn compact(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let context = Context::load(global)?;
    let mut store = context.open_store::<Fingerprint>()?;
    let report = store.compact()?;
    if !global.quiet {
        eprintln!(
            "   Compacted {}: {}",
            store.path().display(),
            summarize(&report)
        );
    }
    Ok(0)
}

fn summarize(report: &CompactionReport) -> String {
    if report.is_noop() {
        return "nothing to do".to_string();
    }
    format!(
        "{} loose records merged, {} records archived, {} loose files removed",
        report.loose_before, report.archived, report.removed
    )
}

/// Runs the `tessera keys` command, one key per line on stdout.
pub fn keys(global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let context = Context::load(global)?;
    let store = context.open_store::<Fingerprint>()?;
    let keys = store.keys()?;
    for key in &keys {
        println!("{key}");
    }
    if global.verbose {
        eprintln!(
            "{} keys ({} loose, {} archived)",
            keys.len(),
            store.loose_keys()?.len(),
            store.archived_keys()?.len()
        );
    }
    Ok(0)
}

/// Runs the `tessera show` command, printing the record as JSON.
pub fn show(key: &str, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let key = CacheKey::parse(key)?;
    let context = Context::load(global)?;
    let mut store = context.open_store::<Fingerprint>()?;
    let value = store.get(&key)?;
    println!("{}", serde_json::to_string(&value)?);
    Ok(0)
}
