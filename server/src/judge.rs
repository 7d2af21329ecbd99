use snafu::{ResultExt, Snafu};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::db::DbError;
use crate::problem::Problem;
use crate::stager::{self, StagedDirs};
use crate::types::{now_ns, AppState, JudgeResult, Status, Submission};
use crate::userface::{UserFace, ANSI_GREEN, ANSI_RED, ANSI_RESET};
use crate::workflow::WorkflowRunner;

#[derive(Debug, Snafu)]
pub enum SubmitError {
    #[snafu(display("submissions are currently paused"))]
    Paused,
    #[snafu(display("unknown problem `{id}`"))]
    UnknownProblem { id: String },
    #[snafu(display("could not persist the submission"))]
    Persist { source: DbError },
}

/// What the SSH command handler holds while its judgement runs: the live
/// tee and the completion signal. The task itself runs detached and is not
/// cancelled if the session goes away.
pub struct JudgeHandle {
    pub id: String,
    pub face: UserFace,
    pub done: oneshot::Receiver<()>,
}

/// Submission ids are the submit-time nanosecond timestamp, bumped when two
/// submissions land in the same nanosecond so ids stay unique and monotonic.
static LAST_ID: AtomicI64 = AtomicI64::new(0);

fn next_id() -> String {
    let mut candidate = now_ns();
    loop {
        let last = LAST_ID.load(Ordering::Relaxed);
        if candidate <= last {
            candidate = last + 1;
        }
        if LAST_ID
            .compare_exchange(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return candidate.to_string();
        }
    }
}

/// Accepts a submission and spawns its judgement task.
pub async fn submit(state: &AppState, user: &str, problem_id: &str) -> Result<JudgeHandle, SubmitError> {
    if state.paused.load(Ordering::Relaxed) {
        return PausedSnafu.fail();
    }
    let problem = state
        .problems
        .get(problem_id)
        .ok_or_else(|| SubmitError::UnknownProblem {
            id: problem_id.to_string(),
        })?;

    // The user row (and its access token) exists from the first submission.
    state.db.ensure_user(user).await.context(PersistSnafu)?;

    let id = next_id();
    let mut sub = Submission::new(id.clone(), user.to_string(), problem_id.to_string());
    sub.submits_dir = state.config.user_inbox(user).to_string_lossy().into_owned();
    sub.workdir = state
        .config
        .submit_work_dir
        .join(format!("{id}-{user}"))
        .to_string_lossy()
        .into_owned();
    state.db.save_submission(&sub).await.context(PersistSnafu)?;

    info!(submit = %id, user, problem = problem_id, workdir = %sub.workdir, "New submission");

    let (done_tx, done_rx) = oneshot::channel();
    let face = sub.user_face.clone();
    let task_state = state.clone();
    tokio::spawn(async move {
        run(task_state, sub, problem, done_tx).await;
    });

    Ok(JudgeHandle { id, face, done: done_rx })
}

/// One judgement, start to terminal state. Never panics the process: every
/// failure becomes a terminal `failed` row with an operator-readable
/// message.
async fn run(
    state: AppState,
    mut sub: Submission,
    problem: Arc<Problem>,
    done_tx: oneshot::Sender<()>,
) {
    sub.user_face
        .writeln(&format!("submission {} for problem {}", sub.id, sub.problem));

    let verdict = pipeline(&state, &mut sub, &problem).await;

    match verdict {
        Ok(result) => {
            sub.judge_result = result;
            sub.msg = "judge successfully finished".to_string();
            sub.set_status(Status::Completed);
            sub.user_face.writeln(&format!(
                "{ANSI_GREEN}== completed: {} (score {}) =={ANSI_RESET}",
                sub.judge_result.msg, sub.judge_result.score
            ));
        }
        Err(msg) => {
            sub.msg = msg;
            sub.set_status(Status::Failed);
            sub.user_face
                .writeln(&format!("{ANSI_RED}== failed: {} =={ANSI_RESET}", sub.msg));
        }
    }

    persist(&state, &sub).await;
    let _ = done_tx.send(());

    if let Err(e) = state.db.update_user_best(&sub, problem.weight).await {
        error!(submit = %sub.id, user = %sub.user, error = %e, "Could not update user score");
    }

    info!(
        submit = %sub.id,
        user = %sub.user,
        problem = %sub.problem,
        status = %sub.status,
        msg = %sub.msg,
        score = sub.judge_result.score,
        "Judgement finished"
    );
}

/// The fallible part of a judgement: each stage transitions the state
/// machine and a failure maps to the user-facing message for that stage.
async fn pipeline(
    state: &AppState,
    sub: &mut Submission,
    problem: &Problem,
) -> Result<JudgeResult, String> {
    let config = &state.config;
    let workdir = PathBuf::from(&sub.workdir);

    sub.set_status(Status::PrepDirs);
    persist(state, sub).await;

    let (uid, gid) = (config.submit_uid, config.submit_gid);
    let dirs = {
        let workdir = workdir.clone();
        tokio::task::spawn_blocking(move || stager::create_dirs(&workdir, uid, gid)).await
    };
    let dirs: StagedDirs = match dirs {
        Ok(Ok(dirs)) => dirs,
        Ok(Err(e)) => {
            error!(submit = %sub.id, error = %e, "Could not create submission workdir");
            return Err("failed to create submit workdir".to_string());
        }
        Err(e) => {
            error!(submit = %sub.id, error = %e, "Directory staging task died");
            return Err("failed to create submit workdir".to_string());
        }
    };

    sub.set_status(Status::PrepFiles);
    persist(state, sub).await;

    let staged = {
        let inbox = PathBuf::from(&sub.submits_dir);
        let submits = dirs.submits.clone();
        let entries = problem.submits.clone();
        tokio::task::spawn_blocking(move || {
            stager::stage_files(&inbox, &submits, &entries, uid, gid)
        })
        .await
    };
    match staged {
        Ok(Ok(files)) => sub.files = files,
        Ok(Err(e)) => {
            error!(submit = %sub.id, error = %e, "Could not stage submit files");
            return Err(e.user_message());
        }
        Err(e) => {
            error!(submit = %sub.id, error = %e, "File staging task died");
            return Err("failed to copy submit file".to_string());
        }
    }

    sub.set_status(Status::RunWorkflow);
    persist(state, sub).await;

    let runner = WorkflowRunner {
        docker: &state.docker,
        db: &state.db,
        config,
    };
    runner
        .run(sub, problem, &dirs)
        .await
        .map_err(|e| e.to_string())?;

    sub.set_status(Status::CollectResult);
    persist(state, sub).await;

    let raw = tokio::fs::read(dirs.work.join("result.json"))
        .await
        .map_err(|e| {
            warn!(submit = %sub.id, error = %e, "Could not read result file");
            "failed to read result file".to_string()
        })?;

    parse_verdict(&raw).map_err(|e| {
        warn!(submit = %sub.id, error = %e, "Could not parse result file");
        "failed to parse result file".to_string()
    })
}

/// Schema validation of the verdict; the engine does not interpret it
/// further.
fn parse_verdict(raw: &[u8]) -> Result<JudgeResult, String> {
    let result: JudgeResult =
        serde_json::from_slice(raw).map_err(|e| format!("invalid verdict JSON: {e}"))?;
    if !result.score.is_finite() || result.score < 0.0 {
        return Err(format!("verdict score out of range: {}", result.score));
    }
    Ok(result)
}

async fn persist(state: &AppState, sub: &Submission) {
    if let Err(e) = state.db.save_submission(sub).await {
        warn!(submit = %sub.id, error = %e, "Could not persist submission");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let mut seen = HashSet::new();
        let mut previous = 0i64;
        for _ in 0..1000 {
            let id = next_id();
            let numeric: i64 = id.parse().unwrap();
            assert!(numeric > previous);
            previous = numeric;
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn verdicts_parse_or_fail_loudly() {
        let ok = parse_verdict(br#"{"Success":true,"Score":100,"Msg":"ok"}"#).unwrap();
        assert!(ok.success);
        assert_eq!(ok.score, 100.0);

        assert!(parse_verdict(b"{malformed").is_err());
        assert!(parse_verdict(br#"{"Success":true,"Score":-3}"#).is_err());
        // Unknown extra fields are the workflow's business, not ours.
        assert!(parse_verdict(br#"{"Success":false,"Score":0,"Extra":1}"#).is_ok());
    }
}
