use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, Snafu)]
pub enum ProblemLoadError {
    #[snafu(display("Could not list problems directory `{}`", path.display()))]
    ListDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Could not read problem file `{}`", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Could not parse problem file `{}`", path.display()))]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[snafu(display("Problem file `{}` has an empty id", path.display()))]
    EmptyId { path: PathBuf },
}

/// One file or directory the user must upload for a problem.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitEntry {
    pub path: String,
    #[serde(rename = "isdir", default)]
    pub is_dir: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MountEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
}

/// One judging stage: a single container running its steps in order.
#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    pub image: String,
    pub steps: Vec<String>,
    /// Per-step timeout in seconds, also used as the container stop timeout.
    pub timeout: i64,
    #[serde(default)]
    pub root: bool,
    #[serde(rename = "disablenetwork", default)]
    pub disable_network: bool,
    #[serde(rename = "networkhostmode", default)]
    pub network_host_mode: bool,
    /// 1-based step indices whose output is tee'd to the user terminal.
    #[serde(default)]
    pub show: Vec<usize>,
    /// 1-based step indices executed with elevated container capabilities.
    #[serde(rename = "privilegedsteps", default)]
    pub privileged_steps: Vec<usize>,
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Problem {
    #[serde(default)]
    pub version: i64,
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub submits: Vec<SubmitEntry>,
    #[serde(default)]
    pub workflow: Vec<Workflow>,
}

impl Problem {
    fn normalize(mut self) -> Self {
        if self.weight <= 0.0 {
            self.weight = 1.0;
        }
        self
    }
}

type ProblemMap = HashMap<String, Arc<Problem>>;

/// Read-mostly index of the problems directory. `reload` swaps the whole
/// snapshot; running submissions keep the `Arc<Problem>` they started with.
#[derive(Debug, Clone)]
pub struct ProblemRegistry {
    dir: PathBuf,
    snapshot: Arc<RwLock<Arc<ProblemMap>>>,
}

impl ProblemRegistry {
    pub fn load(dir: &Path) -> Result<Self, ProblemLoadError> {
        let problems = load_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            snapshot: Arc::new(RwLock::new(Arc::new(problems))),
        })
    }

    /// Re-reads the problems directory. On error the previous snapshot stays.
    pub fn reload(&self) -> Result<usize, ProblemLoadError> {
        let problems = load_dir(&self.dir)?;
        let count = problems.len();
        *self.snapshot.write().expect("problem registry lock poisoned") = Arc::new(problems);
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Problem>> {
        self.snapshot
            .read()
            .expect("problem registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn snapshot(&self) -> Arc<ProblemMap> {
        self.snapshot
            .read()
            .expect("problem registry lock poisoned")
            .clone()
    }

    /// Problem ids in sorted order, for listings.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshot().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn load_dir(dir: &Path) -> Result<ProblemMap, ProblemLoadError> {
    let mut problems = ProblemMap::new();
    let entries = std::fs::read_dir(dir).context(ListDirSnafu { path: dir })?;

    for entry in entries {
        let entry = entry.context(ListDirSnafu { path: dir })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let problem = load_file(&path)?;
        info!(id = %problem.id, file = %path.display(), "Loaded problem");
        problems.insert(problem.id.clone(), Arc::new(problem));
    }

    Ok(problems)
}

fn load_file(path: &Path) -> Result<Problem, ProblemLoadError> {
    let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    let problem: Problem = serde_yaml::from_str(&raw).context(ParseFileSnafu { path })?;
    snafu::ensure!(!problem.id.is_empty(), EmptyIdSnafu { path });
    Ok(problem.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const P1: &str = r#"
version: 1
id: p1
text: "print the answer"
weight: 2.5
submits:
  - path: hello.txt
  - path: src
    isdir: true
workflow:
  - image: docker.io/library/alpine:3.20
    steps:
      - "cat /submits/hello.txt > /work/out"
      - "printf '{\"Success\":true,\"Score\":100,\"Msg\":\"ok\"}' > /work/result.json"
    timeout: 60
    show: [1, 2]
    privilegedsteps: [2]
    disablenetwork: true
    mounts:
      - type: bind
        source: /opt/testdata
        target: /data
        readonly: true
"#;

    #[test]
    fn parses_a_problem_file() {
        let problem: Problem = serde_yaml::from_str(P1).unwrap();
        let problem = problem.normalize();
        assert_eq!(problem.id, "p1");
        assert_eq!(problem.weight, 2.5);
        assert_eq!(problem.submits.len(), 2);
        assert!(!problem.submits[0].is_dir);
        assert!(problem.submits[1].is_dir);

        let workflow = &problem.workflow[0];
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.timeout, 60);
        assert!(workflow.disable_network);
        assert!(!workflow.network_host_mode);
        assert_eq!(workflow.show, vec![1, 2]);
        assert_eq!(workflow.privileged_steps, vec![2]);
        assert_eq!(workflow.mounts[0].kind, "bind");
        assert!(workflow.mounts[0].readonly);
    }

    #[test]
    fn missing_weight_defaults_to_one() {
        let problem: Problem =
            serde_yaml::from_str("id: p2\nworkflow: []\nsubmits: []\n").unwrap();
        assert_eq!(problem.normalize().weight, 1.0);
    }

    #[test]
    fn registry_indexes_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("p1.yaml")).unwrap();
        f.write_all(P1.as_bytes()).unwrap();

        let registry = ProblemRegistry::load(dir.path()).unwrap();
        assert!(registry.get("p1").is_some());
        assert!(registry.get("p2").is_none());

        let held = registry.get("p1").unwrap();

        let mut f = std::fs::File::create(dir.path().join("p2.yaml")).unwrap();
        f.write_all(b"id: p2\n").unwrap();
        assert_eq!(registry.reload().unwrap(), 2);
        assert!(registry.get("p2").is_some());

        // The snapshot taken before the reload is unaffected.
        assert_eq!(held.id, "p1");
        assert_eq!(held.weight, 2.5);
    }

    #[test]
    fn empty_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "text: no id here\n").unwrap();
        assert!(ProblemRegistry::load(dir.path()).is_err());
    }
}
