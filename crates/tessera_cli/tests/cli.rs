use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tessera_common::{KeyHasher, Structure};

fn tessera(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tessera"))
        .current_dir(cwd)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .unwrap()
}

fn success(output: Output) -> Output {
    assert!(
        output.status.success(),
        "tessera failed with {}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn dimer(i: u32) -> Structure {
    let mut s = Structure::molecule(
        vec![1, 8, 1],
        vec![
            [0.0, 0.0, 0.0],
            [1.0 + 0.1 * f64::from(i), 0.0, 0.0],
            [0.0, 1.5, 0.25 * f64::from(i)],
        ],
    );
    if i % 2 == 1 {
        s.pbc = [true, true, true];
        s.cell = [[4.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 4.0]];
    }
    s
}

fn write_items(dir: &Path, items: &BTreeMap<String, Structure>) -> PathBuf {
    let path = dir.join("items.json");
    std::fs::write(&path, serde_json::to_string(items).unwrap()).unwrap();
    path
}

fn loose_records(store: &Path) -> BTreeMap<String, Vec<u8>> {
    std::fs::read_dir(store.join("loose"))
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (
                e.file_name().to_string_lossy().into_owned(),
                std::fs::read(e.path()).unwrap(),
            )
        })
        .collect()
}

#[test]
fn serial_and_distributed_runs_store_identical_records() {
    let dir = tempfile::tempdir().unwrap();
    let items: BTreeMap<String, Structure> =
        (0..10).map(|i| (format!("s{i}"), dimer(i))).collect();
    write_items(dir.path(), &items);

    success(tessera(
        dir.path(),
        &["--store", "serial", "ensure", "items.json", "-j", "1"],
    ));
    let parallel = success(tessera(
        dir.path(),
        &["--store", "parallel", "ensure", "items.json", "-j", "4"],
    ));
    assert!(stderr(&parallel).contains("computed by 4 workers"));

    let serial = loose_records(&dir.path().join("serial.fpdb"));
    let distributed = loose_records(&dir.path().join("parallel.fpdb"));
    assert_eq!(serial.len(), 10);
    assert_eq!(serial, distributed);
}

#[test]
fn duplicates_give_one_record_each_and_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let items: BTreeMap<String, Structure> = [("a", dimer(0)), ("b", dimer(1)), ("c", dimer(0))]
        .into_iter()
        .map(|(n, s)| (n.to_string(), s))
        .collect();
    write_items(dir.path(), &items);

    let hashed = success(tessera(dir.path(), &["hash", "items.json"]));
    let lines: Vec<String> = stdout(&hashed).lines().map(String::from).collect();
    assert_eq!(lines.len(), 3);
    let x = KeyHasher::hash(&dimer(0)).to_string();
    assert_eq!(lines[0], format!("{x}  a"));
    assert_eq!(lines[2], format!("{x}  c"));
    assert!(stderr(&hashed).contains("1 duplicates"));

    let ensured = success(tessera(dir.path(), &["ensure", "items.json", "-j", "1"]));
    assert!(stderr(&ensured).contains("warning: 1 duplicate items in input"));

    let keys = success(tessera(dir.path(), &["keys"]));
    assert_eq!(stdout(&keys).lines().count(), 2);
    assert!(dir.path().join("fingerprints.fpdb").is_dir());
}

#[test]
fn second_run_is_up_to_date() {
    let dir = tempfile::tempdir().unwrap();
    let items: BTreeMap<String, Structure> =
        (0..3).map(|i| (format!("s{i}"), dimer(i))).collect();
    write_items(dir.path(), &items);

    success(tessera(dir.path(), &["ensure", "items.json", "-j", "1"]));
    let before = loose_records(&dir.path().join("fingerprints.fpdb"));
    // Four cores, but nothing is missing so no worker is started.
    let again = success(tessera(dir.path(), &["ensure", "items.json", "-j", "4"]));
    assert!(stderr(&again).contains("up to date"));
    assert_eq!(loose_records(&dir.path().join("fingerprints.fpdb")), before);
}

#[test]
fn records_survive_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let items: BTreeMap<String, Structure> =
        (0..4).map(|i| (format!("s{i}"), dimer(i))).collect();
    write_items(dir.path(), &items);
    success(tessera(dir.path(), &["ensure", "items.json", "-j", "1"]));

    let key = KeyHasher::hash(&dimer(3)).to_string();
    let shown = stdout(&success(tessera(dir.path(), &["show", &key])));

    let compacted = success(tessera(dir.path(), &["compact"]));
    assert!(stderr(&compacted).contains("4 records archived"));
    let store = dir.path().join("fingerprints.fpdb");
    assert!(store.join("archive.tar.gz").is_file());
    assert!(loose_records(&store).is_empty());

    assert_eq!(stdout(&success(tessera(dir.path(), &["show", &key]))), shown);
    assert_eq!(
        stdout(&success(tessera(dir.path(), &["keys"]))).lines().count(),
        4
    );
    let again = success(tessera(dir.path(), &["compact"]));
    assert!(stderr(&again).contains("nothing to do"));
}

#[test]
fn unknown_key_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = tessera(dir.path(), &["show", &"0".repeat(64)]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error:"));

    let output = tessera(dir.path(), &["show", "not-a-key"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn invalid_configuration_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("tessera.toml"),
        "[parallel]\nworker_command = \"tessera worker\"\n",
    )
    .unwrap();
    let output = tessera(dir.path(), &["keys"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("{id}"));
}

#[test]
fn explicit_cores_are_user_specified() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("tessera.toml"),
        "[parallel]\ncores = { nodeA = 2, nodeB = 3 }\n",
    )
    .unwrap();
    let output = success(tessera(dir.path(), &["cores"]));
    assert_eq!(stdout(&output).trim(), "nodeA: 2, nodeB: 3");
    assert!(stderr(&output).contains("5 cores on 2 hosts (user-specified)"));
}
