//! Runner abstraction: how the streamed application is started and
//! supervised.
//!
//! A runner consumes the session's hotplug queue for its whole life and is
//! cooperatively cancellable: a cancel request gives the app the configured
//! grace period to leave, then force-kills it.

mod child;
mod container;
mod process;

pub use child::ChildSessionRunner;
pub use container::ContainerRunner;
pub use process::ProcessRunner;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use selene_types::RunnerConfig;
use tokio_util::sync::CancellationToken;

use crate::devices::PlugQueue;
use crate::error::HostError;
use crate::events::EventBus;

/// Everything a runner needs to start the app for one session.
pub struct RunnerContext {
    pub session_id: u64,
    pub app_state_folder: PathBuf,
    pub plug_queue: Arc<PlugQueue>,
    /// Device nodes of the session's virtual input devices
    pub virtual_inputs: Vec<PathBuf>,
    /// `(host_path, guest_path)` mounts, in order
    pub mounts: Vec<(PathBuf, PathBuf)>,
    pub env: HashMap<String, String>,
    pub render_node: String,
    /// Cancelled when the session stops
    pub cancel: CancellationToken,
    /// How long a cancelled app gets before it is killed
    pub stop_grace: Duration,
}

/// Capability starting and supervising the streamed application.
///
/// `run` returns when the app is over, for whatever reason; an error means
/// the app could not start or died unexpectedly, and terminates the owning
/// session.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, ctx: RunnerContext) -> Result<(), HostError>;

    /// The serializable form written back to the state file.
    fn config(&self) -> RunnerConfig;
}

/// Build the runner for a persisted config.
pub fn runner_from_config(config: &RunnerConfig, bus: Arc<EventBus>) -> Arc<dyn Runner> {
    match config {
        RunnerConfig::Process { run_cmd } => Arc::new(ProcessRunner::new(run_cmd.clone())),
        RunnerConfig::Docker {
            image,
            name,
            mounts,
            env,
            devices,
        } => Arc::new(ContainerRunner::new(
            image.clone(),
            name.clone(),
            mounts.clone(),
            env.clone(),
            devices.clone(),
        )),
        RunnerConfig::ChildSession { parent_session_id } => {
            Arc::new(ChildSessionRunner::new(*parent_session_id, bus))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_round_trips_configs() {
        let bus = EventBus::new();
        let configs = [
            RunnerConfig::Process {
                run_cmd: "true".into(),
            },
            RunnerConfig::Docker {
                image: "ghcr.io/selene-stream/steam:edge".into(),
                name: None,
                mounts: vec![],
                env: vec![],
                devices: vec![],
            },
            RunnerConfig::ChildSession {
                parent_session_id: 4,
            },
        ];
        for config in configs {
            let runner = runner_from_config(&config, bus.clone());
            let back = serde_json::to_value(runner.config()).unwrap();
            let expected = serde_json::to_value(&config).unwrap();
            assert_eq!(back, expected);
        }
    }
}
