//! Reading item files.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tessera_common::Structure;

/// The accepted layouts of an item file.
#[derive(Deserialize)]
#[serde(untagged)]
enum ItemFile {
    Named(BTreeMap<String, Structure>),
    Listed(Vec<Structure>),
}

/// Reads a JSON object of named structures, or a JSON list of structures
/// named by their index.
pub fn read_items(path: &Path) -> Result<Vec<(String, Structure)>, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read items from {}: {e}", path.display()))?;
    parse_items(&text).map_err(|e| format!("invalid item file {}: {e}", path.display()).into())
}

fn parse_items(text: &str) -> Result<Vec<(String, Structure)>, serde_json::Error> {
    Ok(match serde_json::from_str(text)? {
        ItemFile::Named(items) => items.into_iter().collect(),
        ItemFile::Listed(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, s)| (i.to_string(), s))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_items_keep_their_names() {
        let items = parse_items(
            r#"{"b": {"numbers": [1], "positions": [[0, 0, 0]]},
                "a": {"numbers": [8], "positions": [[1, 0, 0]],
                      "pbc": [true, true, true],
                      "cell": [[5, 0, 0], [0, 5, 0], [0, 0, 5]]}}"#,
        )
        .unwrap();
        let names: Vec<_> = items.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(items[0].1.pbc, [true; 3]);
        assert_eq!(items[1].1.cell, [[0.0; 3]; 3]);
    }

    #[test]
    fn listed_items_are_named_by_index() {
        let items = parse_items(
            r#"[{"numbers": [1], "positions": [[0, 0, 0]]},
                {"numbers": [2], "positions": [[0, 0, 0]]}]"#,
        )
        .unwrap();
        assert_eq!(items[1].0, "1");
        assert_eq!(items[1].1.numbers, vec![2]);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = read_items(Path::new("/nonexistent/items.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/items.json"));
    }

    #[test]
    fn malformed_structure_is_rejected() {
        assert!(parse_items(r#"{"a": {"numbers": [1]}}"#).is_err());
    }
}
