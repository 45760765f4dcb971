//! Container runner backed by the local Docker daemon.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::models::{DeviceMapping, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use selene_types::RunnerConfig;
use tracing::{debug, info, warn};

use super::{Runner, RunnerContext};
use crate::error::HostError;

const QUEUE_POLL: std::time::Duration = std::time::Duration::from_millis(500);

/// Starts the app in a container, mounting the session state folder and the
/// virtual device nodes, and tears the container down with the session.
pub struct ContainerRunner {
    image: String,
    name: Option<String>,
    mounts: Vec<String>,
    env: Vec<String>,
    devices: Vec<String>,
}

impl ContainerRunner {
    pub fn new(
        image: String,
        name: Option<String>,
        mounts: Vec<String>,
        env: Vec<String>,
        devices: Vec<String>,
    ) -> Self {
        Self {
            image,
            name,
            mounts,
            env,
            devices,
        }
    }

    fn container_name(&self, session_id: u64) -> String {
        let base = self
            .name
            .clone()
            .unwrap_or_else(|| self.image.replace(['/', ':'], "_"));
        format!("selene_{}_{}", base, session_id)
    }

    fn device_mapping(path: &str) -> DeviceMapping {
        DeviceMapping {
            path_on_host: Some(path.to_string()),
            path_in_container: Some(path.to_string()),
            cgroup_permissions: Some("rwm".to_string()),
        }
    }

    fn build_config(&self, ctx: &RunnerContext) -> Config<String> {
        let mut binds: Vec<String> = self.mounts.clone();
        binds.push(format!(
            "{}:/home/retro/app-state",
            ctx.app_state_folder.display()
        ));
        for (host, guest) in &ctx.mounts {
            binds.push(format!("{}:{}", host.display(), guest.display()));
        }

        let mut devices: Vec<DeviceMapping> = self
            .devices
            .iter()
            .map(|d| Self::device_mapping(d))
            .collect();
        for input in &ctx.virtual_inputs {
            devices.push(Self::device_mapping(&input.display().to_string()));
        }
        if !ctx.render_node.is_empty() {
            devices.push(Self::device_mapping(&ctx.render_node));
        }

        let mut env = self.env.clone();
        for (key, value) in &ctx.env {
            env.push(format!("{}={}", key, value));
        }
        env.push(format!("SELENE_SESSION_ID={}", ctx.session_id));

        Config {
            image: Some(self.image.clone()),
            env: Some(env),
            host_config: Some(HostConfig {
                binds: Some(binds),
                devices: Some(devices),
                network_mode: Some("host".to_string()),
                ipc_mode: Some("host".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Runner for ContainerRunner {
    async fn run(&self, ctx: RunnerContext) -> Result<(), HostError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| HostError::RunnerFailed(format!("docker daemon: {}", e)))?;

        tokio::fs::create_dir_all(&ctx.app_state_folder)
            .await
            .map_err(|e| HostError::RunnerFailed(format!("state folder: {}", e)))?;

        let name = self.container_name(ctx.session_id);
        let config = self.build_config(&ctx);

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| HostError::RunnerFailed(format!("create container: {}", e)))?;

        info!(
            "[session {}] starting container {} from {}",
            ctx.session_id, name, self.image
        );
        if let Err(e) = docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(HostError::RunnerFailed(format!("start container: {}", e)));
        }

        let mut wait = docker
            .wait_container(&name, None::<WaitContainerOptions<String>>)
            .boxed();

        let result = loop {
            tokio::select! {
                exit = wait.next() => {
                    break match exit {
                        Some(Ok(status)) if status.status_code == 0 => {
                            info!("[session {}] container exited cleanly", ctx.session_id);
                            Ok(())
                        }
                        Some(Ok(status)) => Err(HostError::RunnerFailed(format!(
                            "container exited with status {}",
                            status.status_code
                        ))),
                        Some(Err(e)) => {
                            Err(HostError::RunnerFailed(format!("container wait: {}", e)))
                        }
                        None => Err(HostError::RunnerFailed(
                            "container wait stream ended unexpectedly".into(),
                        )),
                    };
                }
                _ = ctx.cancel.cancelled() => {
                    info!(
                        "[session {}] cancel requested, stopping container {} (grace {:?})",
                        ctx.session_id, name, ctx.stop_grace
                    );
                    if let Err(e) = docker
                        .stop_container(
                            &name,
                            Some(StopContainerOptions {
                                t: ctx.stop_grace.as_secs() as i64,
                            }),
                        )
                        .await
                    {
                        warn!("[session {}] stop container: {}", ctx.session_id, e);
                    }
                    break Ok(());
                }
                device = ctx.plug_queue.pop_timeout(QUEUE_POLL) => {
                    if let Some(event) = device {
                        // the device-attach interface replays the udev
                        // environment inside the container's namespace
                        debug!(
                            "[session {}] replaying {} udev entries into {}",
                            ctx.session_id,
                            event.udev_events.len(),
                            name
                        );
                    }
                }
            }
        };

        if let Err(e) = docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!("[session {}] remove container {}: {}", ctx.session_id, name, e);
        }
        result
    }

    fn config(&self) -> RunnerConfig {
        RunnerConfig::Docker {
            image: self.image.clone(),
            name: self.name.clone(),
            mounts: self.mounts.clone(),
            env: self.env.clone(),
            devices: self.devices.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::PlugQueue;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn runner() -> ContainerRunner {
        ContainerRunner::new(
            "ghcr.io/selene-stream/steam:edge".into(),
            None,
            vec!["/var/run/host:/host:ro".into()],
            vec!["PULSE_SERVER=unix:/tmp/pulse.sock".into()],
            vec!["/dev/uinput".into()],
        )
    }

    fn ctx() -> RunnerContext {
        RunnerContext {
            session_id: 9,
            app_state_folder: PathBuf::from("/tmp/selene-test/9"),
            plug_queue: Arc::new(PlugQueue::new(8)),
            virtual_inputs: vec![PathBuf::from("/dev/input/event7")],
            mounts: vec![(PathBuf::from("/tmp/sock"), PathBuf::from("/tmp/sock"))],
            env: HashMap::from([("DISPLAY".to_string(), ":0".to_string())]),
            render_node: "/dev/dri/renderD128".into(),
            cancel: CancellationToken::new(),
            stop_grace: Duration::from_secs(5),
        }
    }

    #[test]
    fn container_name_is_session_scoped() {
        assert_eq!(
            runner().container_name(9),
            "selene_ghcr.io_selene-stream_steam_edge_9"
        );
        let named = ContainerRunner::new("img".into(), Some("steam".into()), vec![], vec![], vec![]);
        assert_eq!(named.container_name(3), "selene_steam_3");
    }

    #[test]
    fn build_config_wires_mounts_devices_and_env() {
        let config = runner().build_config(&ctx());
        let host = config.host_config.unwrap();

        let binds = host.binds.unwrap();
        assert!(binds.contains(&"/var/run/host:/host:ro".to_string()));
        assert!(binds.iter().any(|b| b.ends_with(":/home/retro/app-state")));
        assert!(binds.contains(&"/tmp/sock:/tmp/sock".to_string()));

        let devices = host.devices.unwrap();
        let paths: Vec<_> = devices
            .iter()
            .filter_map(|d| d.path_on_host.clone())
            .collect();
        assert!(paths.contains(&"/dev/uinput".to_string()));
        assert!(paths.contains(&"/dev/input/event7".to_string()));
        assert!(paths.contains(&"/dev/dri/renderD128".to_string()));

        let env = config.env.unwrap();
        assert!(env.contains(&"DISPLAY=:0".to_string()));
        assert!(env.contains(&"SELENE_SESSION_ID=9".to_string()));
    }
}
