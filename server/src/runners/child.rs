//! Co-op child session runner.
//!
//! A child session has no app of its own: it forwards every device its
//! client plugs into an already running parent session, and unplugs them
//! all again when the child leaves.

use std::sync::Arc;

use async_trait::async_trait;
use selene_types::RunnerConfig;
use tracing::{debug, info};

use super::{Runner, RunnerContext};
use crate::devices::{PlugDeviceEvent, UnplugDeviceEvent};
use crate::error::HostError;
use crate::events::{EventBus, SessionEvent};

const QUEUE_POLL: std::time::Duration = std::time::Duration::from_millis(500);

pub struct ChildSessionRunner {
    parent_session_id: u64,
    bus: Arc<EventBus>,
}

impl ChildSessionRunner {
    pub fn new(parent_session_id: u64, bus: Arc<EventBus>) -> Self {
        Self {
            parent_session_id,
            bus,
        }
    }
}

#[async_trait]
impl Runner for ChildSessionRunner {
    async fn run(&self, ctx: RunnerContext) -> Result<(), HostError> {
        info!(
            "[session {}] joining parent session {}",
            ctx.session_id, self.parent_session_id
        );

        // history of forwarded devices, to clean up when the child is over
        let mut plugged: Vec<Arc<PlugDeviceEvent>> = Vec::new();

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                device = ctx.plug_queue.pop_timeout(QUEUE_POLL) => {
                    if let Some(event) = device {
                        let forwarded = Arc::new(PlugDeviceEvent {
                            session_id: self.parent_session_id,
                            udev_events: event.udev_events.clone(),
                            hw_db_entries: event.hw_db_entries.clone(),
                        });
                        debug!(
                            "[session {}] forwarding device to parent {}",
                            ctx.session_id, self.parent_session_id
                        );
                        self.bus.publish(SessionEvent::PlugDevice(forwarded.clone()));
                        plugged.push(forwarded);
                    }
                }
            }
        }

        // the child is over, unplug everything it brought along
        for event in plugged {
            self.bus
                .publish(SessionEvent::UnplugDevice(Arc::new(UnplugDeviceEvent {
                    session_id: self.parent_session_id,
                    udev_events: event.udev_events.clone(),
                    hw_db_entries: event.hw_db_entries.clone(),
                })));
        }
        info!(
            "[session {}] left parent session {}",
            ctx.session_id, self.parent_session_id
        );
        Ok(())
    }

    fn config(&self) -> RunnerConfig {
        RunnerConfig::ChildSession {
            parent_session_id: self.parent_session_id,
        }
    }
}
