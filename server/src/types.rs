use crate::config::Config;
use crate::db::Database;
use crate::docker::DockerClient;
use crate::problem::ProblemRegistry;
use crate::userface::UserFace;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared handles for everything living as long as the process.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub docker: DockerClient,
    pub db: Database,
    pub problems: ProblemRegistry,
    /// Set by `adm pause`; rejects new submissions while true.
    pub paused: Arc<AtomicBool>,
}

pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_nanos() as i64
}

/// Lifecycle state of a submission. The string forms are the persisted
/// vocabulary, so `Display` and `FromStr` must stay inverse of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Init,
    PrepDirs,
    PrepFiles,
    RunWorkflow,
    /// Entered workflow `workflow` (0-based).
    Workflow { workflow: usize },
    /// Running step `step` (1-based) of workflow `workflow` (0-based).
    WorkflowStep { workflow: usize, step: usize },
    CollectResult,
    Completed,
    Failed,
    /// Assigned on startup to rows a previous process left unfinished.
    Dead,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Dead)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::PrepDirs => write!(f, "prep_dirs"),
            Self::PrepFiles => write!(f, "prep_files"),
            Self::RunWorkflow => write!(f, "run_workflow"),
            Self::Workflow { workflow } => write!(f, "run_workflow-{workflow}"),
            Self::WorkflowStep { workflow, step } => {
                write!(f, "run_workflow-{workflow}_{step}")
            }
            Self::CollectResult => write!(f, "collect_result"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => return Ok(Self::Init),
            "prep_dirs" => return Ok(Self::PrepDirs),
            "prep_files" => return Ok(Self::PrepFiles),
            "run_workflow" => return Ok(Self::RunWorkflow),
            "collect_result" => return Ok(Self::CollectResult),
            "completed" => return Ok(Self::Completed),
            "failed" => return Ok(Self::Failed),
            "dead" => return Ok(Self::Dead),
            _ => {}
        }

        let rest = s
            .strip_prefix("run_workflow-")
            .ok_or_else(|| format!("Invalid submission status: `{s}`"))?;
        let parse = |v: &str| {
            v.parse::<usize>()
                .map_err(|_| format!("Invalid submission status: `{s}`"))
        };
        match rest.split_once('_') {
            Some((workflow, step)) => Ok(Self::WorkflowStep {
                workflow: parse(workflow)?,
                step: parse(step)?,
            }),
            None => Ok(Self::Workflow {
                workflow: parse(rest)?,
            }),
        }
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// One user artifact copied into the staging tree, with its audit hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedFile {
    pub path: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStepResult {
    pub logs: String,
    pub exit_code: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub success: bool,
    /// Aggregate container logs fetched after the last step.
    pub logs: String,
    pub exit_code: i64,
    pub steps: Vec<WorkflowStepResult>,
}

/// The verdict document a workflow writes to `/work/result.json`. Opaque to
/// the engine beyond this schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct JudgeResult {
    pub success: bool,
    pub score: f64,
    pub msg: String,
    /// Peak memory in bytes, as reported by the workflow.
    pub memory: u64,
    /// Wall time in nanoseconds, as reported by the workflow.
    pub time: u64,
}

/// The per-submission record. Every transition is persisted; the user-face
/// buffer rides along and is stored as raw bytes.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: String,
    pub user: String,
    pub problem: String,
    pub submit_time: i64,
    pub last_update: i64,
    pub status: Status,
    pub msg: String,
    pub submits_dir: String,
    pub workdir: String,
    pub files: Vec<SubmittedFile>,
    pub workflow_results: Vec<WorkflowResult>,
    pub judge_result: JudgeResult,
    #[serde(skip)]
    pub user_face: UserFace,
}

impl Submission {
    pub fn new(id: String, user: String, problem: String) -> Self {
        let now = now_ns();
        Self {
            id,
            user,
            problem,
            submit_time: now,
            last_update: now,
            status: Status::Init,
            msg: String::new(),
            submits_dir: String::new(),
            workdir: String::new(),
            files: Vec::new(),
            workflow_results: Vec::new(),
            judge_result: JudgeResult::default(),
            user_face: UserFace::default(),
        }
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.last_update = now_ns();
    }
}

/// Best-score bookkeeping row, owned by the persistence layer and updated
/// whenever a submission terminates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub best_scores: HashMap<String, f64>,
    pub best_submits: HashMap<String, String>,
    pub best_submit_date: HashMap<String, i64>,
    pub total_score: f64,
}

impl User {
    pub fn new(id: String, token: String) -> Self {
        Self {
            id,
            token,
            ..Self::default()
        }
    }

    pub fn calculate_total_score(&mut self) {
        self.total_score = self.best_scores.values().sum();
    }

    /// Folds a terminated submission into the best-score maps. Only a
    /// `completed` submission with a strictly better weighted score changes
    /// anything. Returns whether the row was modified.
    pub fn apply_submission(&mut self, submission: &Submission, weight: f64) -> bool {
        if submission.status != Status::Completed {
            return false;
        }
        let weighted = submission.judge_result.score * weight;
        let current = self
            .best_scores
            .get(&submission.problem)
            .copied()
            .unwrap_or(0.0);
        if weighted <= current {
            return false;
        }
        self.best_scores.insert(submission.problem.clone(), weighted);
        self.best_submits
            .insert(submission.problem.clone(), submission.id.clone());
        self.best_submit_date
            .insert(submission.problem.clone(), submission.submit_time);
        self.calculate_total_score();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        let all = [
            Status::Init,
            Status::PrepDirs,
            Status::PrepFiles,
            Status::RunWorkflow,
            Status::Workflow { workflow: 0 },
            Status::Workflow { workflow: 3 },
            Status::WorkflowStep {
                workflow: 0,
                step: 1,
            },
            Status::WorkflowStep {
                workflow: 2,
                step: 14,
            },
            Status::CollectResult,
            Status::Completed,
            Status::Failed,
            Status::Dead,
        ];
        for status in all {
            let text = status.to_string();
            assert_eq!(text.parse::<Status>(), Ok(status), "via `{text}`");
        }
    }

    #[test]
    fn status_strings_match_the_persisted_vocabulary() {
        assert_eq!(
            Status::WorkflowStep {
                workflow: 0,
                step: 1
            }
            .to_string(),
            "run_workflow-0_1"
        );
        assert_eq!(Status::Workflow { workflow: 1 }.to_string(), "run_workflow-1");
        assert_eq!(Status::PrepDirs.to_string(), "prep_dirs");
    }

    #[test]
    fn status_rejects_garbage() {
        assert!("".parse::<Status>().is_err());
        assert!("running".parse::<Status>().is_err());
        assert!("run_workflow-".parse::<Status>().is_err());
        assert!("run_workflow-a_b".parse::<Status>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(Status::Completed.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Dead.is_terminal());
        assert!(!Status::CollectResult.is_terminal());
        assert!(!Status::WorkflowStep {
            workflow: 0,
            step: 1
        }
        .is_terminal());
    }

    #[test]
    fn judge_result_parses_the_verdict_schema() {
        let result: JudgeResult =
            serde_json::from_str(r#"{"Success":true,"Score":100,"Msg":"ok"}"#).unwrap();
        assert!(result.success);
        assert_eq!(result.score, 100.0);
        assert_eq!(result.msg, "ok");
        assert_eq!(result.memory, 0);
        assert_eq!(result.time, 0);
    }

    fn completed(id: &str, problem: &str, score: f64) -> Submission {
        let mut submission = Submission::new(id.to_string(), "u1".to_string(), problem.to_string());
        submission.status = Status::Completed;
        submission.judge_result.score = score;
        submission
    }

    #[test]
    fn better_score_replaces_the_best() {
        let mut user = User::new("u1".to_string(), "tok".to_string());
        assert!(user.apply_submission(&completed("s1", "p1", 40.0), 1.0));
        assert!(user.apply_submission(&completed("s2", "p1", 60.0), 1.0));
        assert_eq!(user.best_scores["p1"], 60.0);
        assert_eq!(user.best_submits["p1"], "s2");
        assert_eq!(user.total_score, 60.0);
    }

    #[test]
    fn lower_score_does_not_change_the_best() {
        let mut user = User::new("u1".to_string(), "tok".to_string());
        assert!(user.apply_submission(&completed("s1", "p1", 80.0), 1.0));
        assert!(!user.apply_submission(&completed("s2", "p1", 20.0), 1.0));
        assert_eq!(user.best_scores["p1"], 80.0);
        assert_eq!(user.best_submits["p1"], "s1");
    }

    #[test]
    fn weight_scales_the_stored_score() {
        let mut user = User::new("u1".to_string(), "tok".to_string());
        assert!(user.apply_submission(&completed("s1", "p1", 100.0), 0.5));
        assert!(user.apply_submission(&completed("s2", "p2", 10.0), 2.0));
        assert_eq!(user.best_scores["p1"], 50.0);
        assert_eq!(user.best_scores["p2"], 20.0);
        assert_eq!(user.total_score, 70.0);
    }

    #[test]
    fn failed_submissions_never_score() {
        let mut user = User::new("u1".to_string(), "tok".to_string());
        let mut submission = completed("s1", "p1", 100.0);
        submission.status = Status::Failed;
        assert!(!user.apply_submission(&submission, 1.0));
        assert!(user.best_scores.is_empty());
    }
}
