//! `tessera hash`: print the key of every item.

use std::collections::BTreeSet;
use std::path::Path;

use tessera_common::{DuplicateRegistry, KeyHasher};

use crate::items::read_items;
use crate::GlobalArgs;

/// Runs the `tessera hash` command.
///
/// Prints `key  name` per item on stdout, in file order, and reports
/// duplicates on stderr.
pub fn run(items: &Path, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let items = read_items(items)?;
    let mut seen = BTreeSet::new();
    let mut duplicates = DuplicateRegistry::default();
    for (name, structure) in &items {
        let key = KeyHasher::hash(structure);
        println!("{key}  {name}");
        if !seen.insert(key.clone()) {
            duplicates.record(&key);
        }
    }

    if !global.quiet {
        eprintln!(
            "      Hashed {} items: {} unique, {} duplicates",
            items.len(),
            seen.len(),
            duplicates.total()
        );
        for (key, repeats) in duplicates.iter() {
            eprintln!("warning: {key} appears {} times", repeats + 1);
        }
    }
    Ok(0)
}
