//! Child-process runner.

use std::process::Stdio;

use async_trait::async_trait;
use selene_types::RunnerConfig;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Runner, RunnerContext};
use crate::error::HostError;

const QUEUE_POLL: std::time::Duration = std::time::Duration::from_millis(500);

/// Runs the app as a child process on the host, with stdout/stderr
/// redirected into the session state folder.
pub struct ProcessRunner {
    run_cmd: String,
}

impl ProcessRunner {
    pub fn new(run_cmd: String) -> Self {
        Self { run_cmd }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(&self, ctx: RunnerContext) -> Result<(), HostError> {
        tokio::fs::create_dir_all(&ctx.app_state_folder)
            .await
            .map_err(|e| HostError::RunnerFailed(format!("state folder: {}", e)))?;

        let stdout = std::fs::File::create(ctx.app_state_folder.join("stdout.log"))
            .map_err(|e| HostError::RunnerFailed(format!("stdout redirect: {}", e)))?;
        let stderr = std::fs::File::create(ctx.app_state_folder.join("stderr.log"))
            .map_err(|e| HostError::RunnerFailed(format!("stderr redirect: {}", e)))?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.run_cmd)
            .current_dir(&ctx.app_state_folder)
            .envs(&ctx.env)
            .env("RENDER_NODE", &ctx.render_node)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        info!(
            "[session {}] starting process: {}",
            ctx.session_id, self.run_cmd
        );
        let mut child = command
            .spawn()
            .map_err(|e| HostError::RunnerFailed(format!("spawn failed: {}", e)))?;

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) if status.success() => {
                            info!("[session {}] process exited cleanly", ctx.session_id);
                            Ok(())
                        }
                        Ok(status) => Err(HostError::RunnerFailed(format!(
                            "process exited with {}",
                            status
                        ))),
                        Err(e) => Err(HostError::RunnerFailed(format!("wait failed: {}", e))),
                    };
                }
                _ = ctx.cancel.cancelled() => {
                    // the app usually follows its compositor down; give it
                    // the grace period before the hard kill
                    info!(
                        "[session {}] cancel requested, waiting up to {:?} for exit",
                        ctx.session_id, ctx.stop_grace
                    );
                    match tokio::time::timeout(ctx.stop_grace, child.wait()).await {
                        Ok(_) => debug!("[session {}] process left within grace", ctx.session_id),
                        Err(_) => {
                            warn!("[session {}] grace expired, killing process", ctx.session_id);
                            let _ = child.kill().await;
                        }
                    }
                    return Ok(());
                }
                device = ctx.plug_queue.pop_timeout(QUEUE_POLL) => {
                    if let Some(event) = device {
                        // host process shares the host namespace, the nodes
                        // are already visible; replaying udev is a no-op
                        debug!(
                            "[session {}] device event applied ({} udev entries)",
                            ctx.session_id,
                            event.udev_events.len()
                        );
                    }
                }
            }
        }
    }

    fn config(&self) -> RunnerConfig {
        RunnerConfig::Process {
            run_cmd: self.run_cmd.clone(),
        }
    }
}
