//! Working out how many worker slots are available, and on which hosts.
//!
//! An explicit allocation from the configuration always wins. Otherwise an
//! ordered chain of [`CoreDetector`]s inspects the environment: batch
//! schedulers first, this machine's CPU count last. A scheduler whose
//! variables are present but unreadable stops the chain with a
//! [`CoreDetectionError`] instead of silently falling back to one machine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::CoreDetectionError;
use crate::types::CoreSpec;

/// Host name that always means "this machine, no remote shell".
pub const LOCALHOST: &str = "localhost";

/// Number of worker slots per host, ordered by host name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreMap(BTreeMap<String, usize>);

impl CoreMap {
    /// An empty allocation.
    pub fn new() -> Self {
        Self::default()
    }

    /// All slots on this machine.
    pub fn local(cores: usize) -> Self {
        Self::from_iter([(LOCALHOST.to_string(), cores)])
    }

    /// Adds `cores` slots to `host`.
    pub fn add(&mut self, host: impl Into<String>, cores: usize) {
        *self.0.entry(host.into()).or_insert(0) += cores;
    }

    /// Slots on `host`, if it is part of the allocation.
    pub fn get(&self, host: &str) -> Option<usize> {
        self.0.get(host).copied()
    }

    /// Total slots across all hosts.
    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    /// Number of hosts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no host is allocated.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates `(host, cores)` in host order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0.iter().map(|(h, n)| (h.as_str(), *n))
    }
}

impl FromIterator<(String, usize)> for CoreMap {
    fn from_iter<I: IntoIterator<Item = (String, usize)>>(iter: I) -> Self {
        let mut map = CoreMap::new();
        for (host, cores) in iter {
            map.add(host, cores);
        }
        map
    }
}

impl fmt::Display for CoreMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (host, cores)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{host}: {cores}")?;
        }
        Ok(())
    }
}

/// A frozen copy of the environment variables detectors look at.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot(BTreeMap<String, String>);

impl EnvSnapshot {
    /// Captures the current process environment.
    pub fn from_process() -> Self {
        Self(
            std::env::vars_os()
                .map(|(k, v)| {
                    (
                        k.to_string_lossy().into_owned(),
                        v.to_string_lossy().into_owned(),
                    )
                })
                .collect(),
        )
    }

    /// Builds a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Value of `name`, if set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn require(&self, name: &str) -> Result<&str, String> {
        self.get(name).ok_or_else(|| format!("{name} is not set"))
    }

    fn dump(&self) -> Vec<(String, String)> {
        self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Outcome of one detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// The detector's variables are absent; try the next one.
    NotApplicable,
    /// The allocation was read successfully.
    Found(CoreMap),
    /// The variables are present but could not be interpreted.
    Failed(String),
}

/// One link in the detection chain.
pub trait CoreDetector {
    /// Name used in logs and errors.
    fn scheduler(&self) -> &'static str;

    /// Inspects `env` for this detector's allocation.
    fn detect(&self, env: &EnvSnapshot) -> Detection;
}

/// Where a core allocation came from, and what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreAssignment {
    /// `user-specified`, a scheduler name, or `single machine`.
    pub source: &'static str,
    /// The allocation itself.
    pub cores: CoreMap,
}

/// The detectors tried when no allocation is configured, in order.
pub fn default_detectors() -> Vec<Box<dyn CoreDetector>> {
    vec![
        Box::new(SlurmDetector),
        Box::new(PbsDetector),
        Box::new(LoadLevelerDetector),
        Box::new(SgeDetector),
        Box::new(LocalMachineDetector),
    ]
}

/// Uses `spec` when given, otherwise runs the default detector chain.
pub fn resolve_cores(
    spec: Option<&CoreSpec>,
    env: &EnvSnapshot,
) -> Result<CoreAssignment, CoreDetectionError> {
    match spec {
        Some(spec) => Ok(CoreAssignment {
            source: "user-specified",
            cores: spec.to_core_map(),
        }),
        None => detect_cores(env, &default_detectors()),
    }
}

/// Runs `detectors` in order and returns the first allocation found.
pub fn detect_cores(
    env: &EnvSnapshot,
    detectors: &[Box<dyn CoreDetector>],
) -> Result<CoreAssignment, CoreDetectionError> {
    for detector in detectors {
        let scheduler = detector.scheduler();
        match detector.detect(env) {
            Detection::NotApplicable => continue,
            Detection::Found(cores) if cores.total() > 0 => {
                return Ok(CoreAssignment {
                    source: scheduler,
                    cores,
                })
            }
            Detection::Found(_) => {
                return Err(failure(scheduler, "allocation has no cores".into(), env))
            }
            Detection::Failed(reason) => return Err(failure(scheduler, reason, env)),
        }
    }
    Err(failure(
        "environment",
        "no detector produced an allocation".into(),
        env,
    ))
}

fn failure(scheduler: &'static str, reason: String, env: &EnvSnapshot) -> CoreDetectionError {
    CoreDetectionError {
        scheduler,
        reason,
        environment: env.dump(),
    }
}

fn parse_count(name: &str, value: &str) -> Result<usize, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("{name}={value:?} is not a core count"))
}

fn read_file(var: &str, path: &str) -> Result<String, String> {
    std::fs::read_to_string(Path::new(path)).map_err(|e| format!("cannot read {var} {path}: {e}"))
}

fn into_detection(result: Result<CoreMap, String>) -> Detection {
    match result {
        Ok(map) => Detection::Found(map),
        Err(reason) => Detection::Failed(reason),
    }
}

/// SLURM: `SLURM_JOB_NODELIST`, `SLURM_JOB_NUM_NODES` and the tasks per node.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlurmDetector;

impl CoreDetector for SlurmDetector {
    fn scheduler(&self) -> &'static str {
        "SLURM"
    }

    fn detect(&self, env: &EnvSnapshot) -> Detection {
        let Some(nodelist) = env
            .get("SLURM_JOB_NODELIST")
            .or_else(|| env.get("SLURM_NODELIST"))
        else {
            return Detection::NotApplicable;
        };
        into_detection(slurm_allocation(env, nodelist))
    }
}

fn slurm_allocation(env: &EnvSnapshot, nodelist: &str) -> Result<CoreMap, String> {
    let (nodes_var, nodes_value) = match env.get("SLURM_JOB_NUM_NODES") {
        Some(v) => ("SLURM_JOB_NUM_NODES", v),
        None => ("SLURM_NNODES", env.require("SLURM_NNODES")?),
    };
    let nnodes = parse_count(nodes_var, nodes_value)?;

    let tasks = match env.get("SLURM_NTASKS_PER_NODE") {
        Some(v) => vec![parse_count("SLURM_NTASKS_PER_NODE", v)?],
        None => expand_task_counts(env.require("SLURM_TASKS_PER_NODE")?, nnodes)?,
    };

    if nnodes == 1 {
        return Ok(CoreMap::local(tasks[0]));
    }

    let hosts = expand_hostlist(nodelist)?;
    if hosts.len() != nnodes {
        return Err(format!(
            "node list {nodelist:?} names {} hosts but {nodes_var} is {nnodes}",
            hosts.len()
        ));
    }
    let per_host: Vec<usize> = match tasks.len() {
        1 => vec![tasks[0]; nnodes],
        n if n == nnodes => tasks,
        n => return Err(format!("{n} task counts for {nnodes} nodes")),
    };
    Ok(hosts.into_iter().zip(per_host).collect())
}

/// Expands SLURM's `2(x3),1` task-count notation into one count per node.
///
/// Never expands to more than `nodes` counts.
fn expand_task_counts(spec: &str, nodes: usize) -> Result<Vec<usize>, String> {
    let too_many = || format!("SLURM_TASKS_PER_NODE {spec:?} lists more than {nodes} nodes");
    let mut counts = Vec::new();
    for part in spec.split(',') {
        let (count, repeat) = match part.split_once("(x") {
            Some((count, repeat)) => (
                count,
                parse_count(
                    "SLURM_TASKS_PER_NODE",
                    repeat.strip_suffix(')').unwrap_or(repeat),
                )?,
            ),
            None => (part, 1),
        };
        let count = parse_count("SLURM_TASKS_PER_NODE", count)?;
        if repeat > nodes - counts.len() {
            return Err(too_many());
        }
        counts.extend(std::iter::repeat(count).take(repeat));
    }
    if counts.is_empty() {
        return Err("SLURM_TASKS_PER_NODE is empty".to_string());
    }
    Ok(counts)
}

/// Expands a compressed host list such as `node[572,578]`, `gpu[01-03],login`.
pub fn expand_hostlist(list: &str) -> Result<Vec<String>, String> {
    let mut hosts = Vec::new();
    for item in split_top_level(list)? {
        let Some((prefix, rest)) = item.split_once('[') else {
            hosts.push(item.to_string());
            continue;
        };
        let (ranges, suffix) = rest
            .split_once(']')
            .ok_or_else(|| format!("unclosed bracket in host list {list:?}"))?;
        if suffix.contains('[') {
            return Err(format!("multiple bracket groups in {item:?} are not supported"));
        }
        for range in ranges.split(',') {
            match range.split_once('-') {
                Some((lo, hi)) => {
                    let width = lo.len();
                    let start: u64 = lo
                        .parse()
                        .map_err(|_| format!("bad range {range:?} in {list:?}"))?;
                    let end: u64 = hi
                        .parse()
                        .map_err(|_| format!("bad range {range:?} in {list:?}"))?;
                    if end < start {
                        return Err(format!("descending range {range:?} in {list:?}"));
                    }
                    for n in start..=end {
                        hosts.push(format!("{prefix}{n:0width$}{suffix}"));
                    }
                }
                None if !range.is_empty() => hosts.push(format!("{prefix}{range}{suffix}")),
                None => return Err(format!("empty entry in host list {list:?}")),
            }
        }
    }
    Ok(hosts)
}

fn split_top_level(list: &str) -> Result<Vec<&str>, String> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced bracket in host list {list:?}"))?
            }
            ',' if depth == 0 => {
                items.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&list[start..]);
    let items: Vec<&str> = items.into_iter().map(str::trim).collect();
    if items.iter().any(|s| s.is_empty()) {
        return Err(format!("empty entry in host list {list:?}"));
    }
    Ok(items)
}

/// PBS/Torque: `PBS_NODEFILE` lists one host per allocated slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PbsDetector;

impl CoreDetector for PbsDetector {
    fn scheduler(&self) -> &'static str {
        "PBS"
    }

    fn detect(&self, env: &EnvSnapshot) -> Detection {
        let Some(path) = env.get("PBS_NODEFILE") else {
            return Detection::NotApplicable;
        };
        into_detection(
            read_file("PBS_NODEFILE", path)
                .and_then(|text| count_hosts(text.lines(), "PBS_NODEFILE")),
        )
    }
}

/// LoadLeveler: `LOADL_PROCESSOR_LIST` names one host per allocated slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadLevelerDetector;

impl CoreDetector for LoadLevelerDetector {
    fn scheduler(&self) -> &'static str {
        "LoadLeveler"
    }

    fn detect(&self, env: &EnvSnapshot) -> Detection {
        let Some(list) = env.get("LOADL_PROCESSOR_LIST") else {
            return Detection::NotApplicable;
        };
        into_detection(count_hosts(
            list.split_whitespace(),
            "LOADL_PROCESSOR_LIST",
        ))
    }
}

fn count_hosts<'a>(hosts: impl Iterator<Item = &'a str>, var: &str) -> Result<CoreMap, String> {
    let map: CoreMap = hosts
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(|h| (h.to_string(), 1))
        .collect();
    if map.is_empty() {
        return Err(format!("{var} lists no hosts"));
    }
    Ok(map)
}

/// Sun Grid Engine: `PE_HOSTFILE` lines of `host slots queue processors`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgeDetector;

impl CoreDetector for SgeDetector {
    fn scheduler(&self) -> &'static str {
        "SGE"
    }

    fn detect(&self, env: &EnvSnapshot) -> Detection {
        let Some(path) = env.get("PE_HOSTFILE") else {
            return Detection::NotApplicable;
        };
        into_detection(read_file("PE_HOSTFILE", path).and_then(|text| parse_pe_hostfile(&text)))
    }
}

fn parse_pe_hostfile(text: &str) -> Result<CoreMap, String> {
    let mut map = CoreMap::new();
    for (number, line) in text.lines().enumerate() {
        let mut fields = line.split_whitespace();
        let Some(host) = fields.next() else {
            continue;
        };
        let slots = fields
            .next()
            .ok_or_else(|| format!("PE_HOSTFILE line {} has no slot count", number + 1))?;
        map.add(host, parse_count("PE_HOSTFILE slots", slots)?);
    }
    if map.is_empty() {
        return Err("PE_HOSTFILE lists no hosts".to_string());
    }
    Ok(map)
}

/// No scheduler: every CPU of this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMachineDetector;

impl CoreDetector for LocalMachineDetector {
    fn scheduler(&self) -> &'static str {
        "single machine"
    }

    fn detect(&self, _env: &EnvSnapshot) -> Detection {
        match std::thread::available_parallelism() {
            Ok(n) => Detection::Found(CoreMap::local(n.get())),
            Err(e) => Detection::Failed(format!("cannot count CPUs: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvSnapshot {
        EnvSnapshot::from_pairs(pairs.iter().copied())
    }

    fn hosts(pairs: &[(&str, usize)]) -> CoreMap {
        pairs.iter().map(|(h, n)| (h.to_string(), *n)).collect()
    }

    // -- Host list expansion --

    #[test]
    fn hostlist_plain_names() {
        assert_eq!(expand_hostlist("a,b").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn hostlist_bracket_list() {
        assert_eq!(
            expand_hostlist("node[572,578]").unwrap(),
            vec!["node572", "node578"]
        );
    }

    #[test]
    fn hostlist_ranges_keep_padding() {
        assert_eq!(
            expand_hostlist("gpu[08-10,15],login").unwrap(),
            vec!["gpu08", "gpu09", "gpu10", "gpu15", "login"]
        );
    }

    #[test]
    fn hostlist_rejects_malformed() {
        assert!(expand_hostlist("node[1-3").is_err());
        assert!(expand_hostlist("node[3-1]").is_err());
        assert!(expand_hostlist("a,,b").is_err());
    }

    // -- SLURM --

    #[test]
    fn slurm_single_node_is_local() {
        let env = env(&[
            ("SLURM_NODELIST", "node17"),
            ("SLURM_NNODES", "1"),
            ("SLURM_NTASKS_PER_NODE", "12"),
        ]);
        assert_eq!(SlurmDetector.detect(&env), Detection::Found(CoreMap::local(12)));
    }

    #[test]
    fn slurm_multi_node() {
        let env = env(&[
            ("SLURM_JOB_NODELIST", "node[572,578]"),
            ("SLURM_JOB_NUM_NODES", "2"),
            ("SLURM_NTASKS_PER_NODE", "8"),
        ]);
        assert_eq!(
            SlurmDetector.detect(&env),
            Detection::Found(hosts(&[("node572", 8), ("node578", 8)]))
        );
    }

    #[test]
    fn slurm_compressed_task_counts() {
        let env = env(&[
            ("SLURM_JOB_NODELIST", "n[1-3]"),
            ("SLURM_JOB_NUM_NODES", "3"),
            ("SLURM_TASKS_PER_NODE", "4(x2),2"),
        ]);
        assert_eq!(
            SlurmDetector.detect(&env),
            Detection::Found(hosts(&[("n1", 4), ("n2", 4), ("n3", 2)]))
        );
    }

    #[test]
    fn slurm_huge_repeat_fails_without_expanding() {
        let env = env(&[
            ("SLURM_JOB_NODELIST", "n[1-2]"),
            ("SLURM_JOB_NUM_NODES", "2"),
            ("SLURM_TASKS_PER_NODE", "1(x99999999999)"),
        ]);
        assert!(matches!(SlurmDetector.detect(&env), Detection::Failed(_)));
    }

    #[test]
    fn task_counts_are_capped_at_node_count() {
        assert_eq!(expand_task_counts("4(x2),2", 3).unwrap(), vec![4, 4, 2]);
        assert!(expand_task_counts("4(x2),2", 2).is_err());
        assert!(expand_task_counts("3,3,3", 2).is_err());
        assert_eq!(expand_task_counts("8", 4).unwrap(), vec![8]);
    }

    #[test]
    fn slurm_node_count_mismatch_fails() {
        let env = env(&[
            ("SLURM_NODELIST", "node[1-3]"),
            ("SLURM_NNODES", "2"),
            ("SLURM_NTASKS_PER_NODE", "4"),
        ]);
        assert!(matches!(SlurmDetector.detect(&env), Detection::Failed(_)));
    }

    #[test]
    fn slurm_absent_is_not_applicable() {
        assert_eq!(SlurmDetector.detect(&env(&[])), Detection::NotApplicable);
    }

    // -- File-based schedulers --

    #[test]
    fn pbs_counts_lines_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes");
        std::fs::write(&path, "n1\nn1\nn2\n\n").unwrap();
        let env = env(&[("PBS_NODEFILE", path.to_str().unwrap())]);
        assert_eq!(
            PbsDetector.detect(&env),
            Detection::Found(hosts(&[("n1", 2), ("n2", 1)]))
        );
    }

    #[test]
    fn pbs_missing_file_fails() {
        let env = env(&[("PBS_NODEFILE", "/nonexistent/tessera/nodes")]);
        assert!(matches!(PbsDetector.detect(&env), Detection::Failed(_)));
    }

    #[test]
    fn loadleveler_counts_hosts() {
        let env = env(&[("LOADL_PROCESSOR_LIST", "a b a c")]);
        assert_eq!(
            LoadLevelerDetector.detect(&env),
            Detection::Found(hosts(&[("a", 2), ("b", 1), ("c", 1)]))
        );
    }

    #[test]
    fn sge_reads_slot_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pe_hostfile");
        std::fs::write(
            &path,
            "compute-0-1 4 all.q@compute-0-1 UNDEFINED\ncompute-0-2 2 all.q UNDEFINED\n",
        )
        .unwrap();
        let env = env(&[("PE_HOSTFILE", path.to_str().unwrap())]);
        assert_eq!(
            SgeDetector.detect(&env),
            Detection::Found(hosts(&[("compute-0-1", 4), ("compute-0-2", 2)]))
        );
    }

    #[test]
    fn sge_bad_slot_count_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pe_hostfile");
        std::fs::write(&path, "host many\n").unwrap();
        let env = env(&[("PE_HOSTFILE", path.to_str().unwrap())]);
        assert!(matches!(SgeDetector.detect(&env), Detection::Failed(_)));
    }

    // -- Chain --

    #[test]
    fn empty_environment_falls_back_to_local_machine() {
        let assignment = detect_cores(&env(&[]), &default_detectors()).unwrap();
        assert_eq!(assignment.source, "single machine");
        assert!(assignment.cores.get(LOCALHOST).unwrap() >= 1);
        assert_eq!(assignment.cores.len(), 1);
    }

    #[test]
    fn recognized_but_broken_scheduler_fails_with_dump() {
        let env = env(&[
            ("SLURM_NODELIST", "node[1-2]"),
            ("SLURM_NNODES", "two"),
            ("SLURM_NTASKS_PER_NODE", "4"),
        ]);
        let err = detect_cores(&env, &default_detectors()).unwrap_err();
        assert_eq!(err.scheduler, "SLURM");
        assert!(err.reason.contains("SLURM_NNODES"));
        assert!(err.environment_dump().contains("SLURM_NNODES: two"));
    }

    #[test]
    fn slurm_takes_precedence_over_sge() {
        let env = env(&[
            ("SLURM_NODELIST", "n1"),
            ("SLURM_NNODES", "1"),
            ("SLURM_NTASKS_PER_NODE", "3"),
            ("PE_HOSTFILE", "/nonexistent"),
        ]);
        let assignment = detect_cores(&env, &default_detectors()).unwrap();
        assert_eq!(assignment.source, "SLURM");
        assert_eq!(assignment.cores.total(), 3);
    }

    #[test]
    fn explicit_spec_skips_detection() {
        let env = env(&[("PBS_NODEFILE", "/nonexistent")]);
        let assignment = resolve_cores(Some(&CoreSpec::Count(2)), &env).unwrap();
        assert_eq!(assignment.source, "user-specified");
        assert_eq!(assignment.cores, CoreMap::local(2));
    }

    #[test]
    fn core_map_display() {
        assert_eq!(hosts(&[("b", 2), ("a", 1)]).to_string(), "a: 1, b: 2");
    }
}
