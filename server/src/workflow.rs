use snafu::Snafu;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::docker::{
    bind_mount, mount_from_entry, DockerClient, RunImageOptions, StreamSink,
};
use crate::problem::{Problem, Workflow};
use crate::stager::StagedDirs;
use crate::types::{Status, Submission, WorkflowResult, WorkflowStepResult};
use crate::userface::{UserFace, ANSI_BLUE, ANSI_RED};

pub const JUDGE_HOSTNAME: &str = "soj-judgement";

#[derive(Debug, Snafu)]
pub enum WorkflowError {
    /// The judge container could not be created or started.
    #[snafu(display("failed to run judge container"))]
    ContainerStart,
    /// A step exited nonzero, errored, or timed out. Indices are 1-based,
    /// matching what the user sees.
    #[snafu(display("failed to run judge {workflow} step {step}"))]
    StepFailed { workflow: usize, step: usize },
}

/// Forwards one demultiplexed exec stream into the user-face, colored.
struct FaceSink<'a> {
    face: &'a UserFace,
    color: &'static str,
}

impl StreamSink for FaceSink<'_> {
    fn write_chunk(&mut self, chunk: &[u8]) {
        self.face.write_colored(self.color, chunk);
    }
}

pub struct WorkflowRunner<'a> {
    pub docker: &'a DockerClient,
    pub db: &'a Database,
    pub config: &'a Config,
}

impl WorkflowRunner<'_> {
    /// Runs every workflow of the problem in order, one container per
    /// workflow, steps strictly sequential. Progress is persisted at each
    /// step boundary.
    pub async fn run(
        &self,
        sub: &mut Submission,
        problem: &Problem,
        dirs: &StagedDirs,
    ) -> Result<(), WorkflowError> {
        for (index, workflow) in problem.workflow.iter().enumerate() {
            sub.set_status(Status::Workflow { workflow: index });
            self.persist(sub).await;
            self.run_workflow(sub, dirs, index, workflow).await?;
        }
        Ok(())
    }

    async fn run_workflow(
        &self,
        sub: &mut Submission,
        dirs: &StagedDirs,
        index: usize,
        workflow: &Workflow,
    ) -> Result<(), WorkflowError> {
        let env = self.workflow_env(sub, dirs);

        let mut mounts = vec![
            bind_mount(
                self.host_path(dirs, "submits"),
                "/submits".to_string(),
                true,
            ),
            bind_mount(self.host_path(dirs, "work"), "/work".to_string(), false),
        ];
        mounts.extend(workflow.mounts.iter().map(mount_from_entry));

        let user = if workflow.root {
            "0".to_string()
        } else {
            self.config.submit_uid.to_string()
        };

        let container = self
            .docker
            .run_image(RunImageOptions {
                name: format!("soj-judge-{}-{}", sub.id, index + 1),
                image: workflow.image.clone(),
                user,
                hostname: JUDGE_HOSTNAME.to_string(),
                workdir: "/work".to_string(),
                env: env.clone(),
                mounts,
                mask_paths: false,
                readonly_rootfs: false,
                disable_network: workflow.disable_network,
                network_host_mode: workflow.network_host_mode,
                stop_timeout: workflow.timeout,
            })
            .await;

        let container = match container {
            Ok(container) => container,
            Err(e) => {
                error!(
                    submit = %sub.id,
                    image = %workflow.image,
                    error = %e,
                    "Could not start judge container"
                );
                return ContainerStartSnafu.fail();
            }
        };

        let steps = self.run_steps(sub, &container, index, workflow, &env).await;

        let result = match steps {
            Ok(steps) => {
                let logs = match self.docker.container_logs(&container).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!(container = %container, error = %e, "Could not fetch container logs");
                        String::new()
                    }
                };
                sub.workflow_results.push(WorkflowResult {
                    success: true,
                    logs,
                    exit_code: 0,
                    steps,
                });
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.docker.clean_container(&container).await;
        result
    }

    async fn run_steps(
        &self,
        sub: &mut Submission,
        container: &str,
        index: usize,
        workflow: &Workflow,
        env: &[String],
    ) -> Result<Vec<WorkflowStepResult>, WorkflowError> {
        let mut steps = Vec::with_capacity(workflow.steps.len());

        for (offset, command) in workflow.steps.iter().enumerate() {
            let step = offset + 1;
            sub.set_status(Status::WorkflowStep {
                workflow: index,
                step,
            });
            self.persist(sub).await;

            let show = workflow.show.contains(&step);
            let privileged = workflow.privileged_steps.contains(&step);

            info!(
                submit = %sub.id,
                image = %workflow.image,
                workflow = index,
                step,
                show,
                privileged,
                timeout = workflow.timeout,
                %command,
                "Running judge step"
            );

            if show {
                sub.user_face.writeln(&format!("$ {command}"));
            }

            let mut stdout = FaceSink {
                face: &sub.user_face,
                color: ANSI_BLUE,
            };
            let mut stderr = FaceSink {
                face: &sub.user_face,
                color: ANSI_RED,
            };
            let (stdout, stderr): (Option<&mut dyn StreamSink>, Option<&mut dyn StreamSink>) =
                if show {
                    (Some(&mut stdout), Some(&mut stderr))
                } else {
                    (None, None)
                };

            let result = self
                .docker
                .exec_container(
                    container,
                    command,
                    workflow.timeout,
                    stdout,
                    stderr,
                    env.to_vec(),
                    privileged,
                )
                .await;

            match result {
                Ok(result) if result.exit_code == 0 => {
                    if show {
                        sub.user_face.writeln(&format!("exit code: {}", result.exit_code));
                    }
                    steps.push(WorkflowStepResult {
                        logs: result.output,
                        exit_code: result.exit_code,
                    });
                }
                Ok(result) => {
                    if show {
                        sub.user_face.writeln(&format!("exit code: {}", result.exit_code));
                    }
                    error!(
                        submit = %sub.id,
                        workflow = index,
                        step,
                        exit_code = result.exit_code,
                        logs = %result.output,
                        "Judge step exited nonzero"
                    );
                    return StepFailedSnafu {
                        workflow: index + 1,
                        step,
                    }
                    .fail();
                }
                Err(e) => {
                    error!(
                        submit = %sub.id,
                        workflow = index,
                        step,
                        error = %e,
                        "Judge step did not finish"
                    );
                    return StepFailedSnafu {
                        workflow: index + 1,
                        step,
                    }
                    .fail();
                }
            }
        }

        Ok(steps)
    }

    fn workflow_env(&self, sub: &Submission, dirs: &StagedDirs) -> Vec<String> {
        workflow_env(self.config, sub, dirs)
    }

    fn host_path(&self, dirs: &StagedDirs, child: &str) -> String {
        host_path(self.config, dirs, child)
    }

    async fn persist(&self, sub: &Submission) {
        if let Err(e) = self.db.save_submission(sub).await {
            warn!(submit = %sub.id, error = %e, "Could not persist submission progress");
        }
    }
}

/// The environment every workflow step sees.
fn workflow_env(config: &Config, sub: &Submission, dirs: &StagedDirs) -> Vec<String> {
    vec![
        "SOJ_SUBMITS_DIR=/submits".to_string(),
        "SOJ_WORK_DIR=/work".to_string(),
        format!("SOJ_REAL_WORKDIR={}", host_path(config, dirs, "work")),
        format!("SOJ_REAL_SUBMITDIR={}", host_path(config, dirs, "submits")),
        format!("SOJ_PROBLEM={}", sub.problem),
        format!("SOJ_SUBMIT={}", sub.id),
        format!("SOJ_WORK_UID={}", config.submit_uid),
        format!("SOJ_WORK_GID={}", config.submit_gid),
    ]
}

/// Host-visible path of a subdirectory of the submission tree. The engine
/// and nested `docker run`s inside workflows need host paths, which differ
/// from the local ones when the judge itself runs in a container.
fn host_path(config: &Config, dirs: &StagedDirs, child: &str) -> String {
    let name = dirs
        .root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    config
        .real_submit_work_dir()
        .join(name)
        .join(child)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> Config {
        serde_yaml::from_str(
            r#"
HostKey: "key"
ListenAddr: "0.0.0.0:2222"
APIAddr: "127.0.0.1:8080"
SubmitsDir: /srv/soj/submits
SubmitWorkDir: /srv/soj/work
ProblemsDir: /srv/soj/problems
RealSubmitsDir: /host/submits
RealSubmitWorkDir: /host/work
SqlitePath: /srv/soj/soj.db
SubmitUid: 1000
SubmitGid: 1000
"#,
        )
        .unwrap()
    }

    fn test_dirs() -> StagedDirs {
        let root = PathBuf::from("/srv/soj/work/1234-u1");
        StagedDirs {
            submits: root.join("submits"),
            work: root.join("work"),
            root,
        }
    }

    #[test]
    fn workflow_env_names_the_submission() {
        let config = test_config();
        let sub = Submission::new("1234".to_string(), "u1".to_string(), "p1".to_string());
        let env = workflow_env(&config, &sub, &test_dirs());

        assert!(env.contains(&"SOJ_SUBMITS_DIR=/submits".to_string()));
        assert!(env.contains(&"SOJ_WORK_DIR=/work".to_string()));
        assert!(env.contains(&"SOJ_PROBLEM=p1".to_string()));
        assert!(env.contains(&"SOJ_SUBMIT=1234".to_string()));
        assert!(env.contains(&"SOJ_WORK_UID=1000".to_string()));
        assert!(env.contains(&"SOJ_WORK_GID=1000".to_string()));
    }

    #[test]
    fn real_paths_are_rebased_onto_the_host_tree() {
        let config = test_config();
        let dirs = test_dirs();
        assert_eq!(host_path(&config, &dirs, "work"), "/host/work/1234-u1/work");
        assert_eq!(
            host_path(&config, &dirs, "submits"),
            "/host/work/1234-u1/submits"
        );
    }

    #[test]
    fn step_failure_message_is_one_based() {
        let err = WorkflowError::StepFailed {
            workflow: 1,
            step: 1,
        };
        assert_eq!(err.to_string(), "failed to run judge 1 step 1");
        assert_eq!(
            WorkflowError::ContainerStart.to_string(),
            "failed to run judge container"
        );
    }
}
