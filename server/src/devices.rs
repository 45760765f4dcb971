//! Virtual device descriptors and the hotplug queue.
//!
//! The kernel-facing side of input (uinput, hidraw, wayland seats) lives
//! behind the [`InputBackend`] capability; the host core only moves
//! descriptors around: which device nodes exist and which udev metadata a
//! runner has to replay inside its namespace for the guest to see them.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use selene_types::ControllerKind;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::HostError;

/// Kinds of virtual input devices a session can attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputDeviceKind {
    Mouse,
    Keyboard,
    PenTablet,
    TouchScreen,
    Joypad(ControllerKind),
}

/// A created virtual device: its node paths plus the udev metadata needed
/// to make the guest recognize it.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    pub kind: InputDeviceKind,
    pub device_nodes: Vec<PathBuf>,
    pub udev_events: Vec<HashMap<String, String>>,
    pub hw_db_entries: Vec<(String, Vec<String>)>,
}

/// Virtual display attached to a session, torn down on stream end.
#[derive(Debug, Clone)]
pub struct VirtualDisplayHandle {
    pub wayland_display_name: String,
}

/// Capability creating virtual input devices.
pub trait InputBackend: Send + Sync {
    fn create(&self, kind: InputDeviceKind) -> Result<VirtualDevice, HostError>;
}

/// Backend that fabricates device descriptors without touching the kernel.
///
/// Used headless and in tests; a real deployment plugs a uinput-backed
/// implementation in instead.
#[derive(Debug, Default)]
pub struct SimulatedInputBackend;

impl InputBackend for SimulatedInputBackend {
    fn create(&self, kind: InputDeviceKind) -> Result<VirtualDevice, HostError> {
        let (name, hw_db): (&str, Vec<(String, Vec<String>)>) = match kind {
            InputDeviceKind::Mouse => ("mouse", vec![]),
            InputDeviceKind::Keyboard => ("keyboard", vec![]),
            InputDeviceKind::PenTablet => ("pen", vec![]),
            InputDeviceKind::TouchScreen => ("touch", vec![]),
            InputDeviceKind::Joypad(controller) => (
                "joypad",
                vec![(
                    format!("evdev:input:joypad-{:?}", controller).to_lowercase(),
                    vec!["ID_INPUT_JOYSTICK=1".to_string()],
                )],
            ),
        };

        let node = PathBuf::from(format!("/dev/input/by-id/virtual-{}", name));
        let mut udev = HashMap::new();
        udev.insert("ACTION".to_string(), "add".to_string());
        udev.insert("DEVNAME".to_string(), node.display().to_string());
        udev.insert("SUBSYSTEM".to_string(), "input".to_string());

        Ok(VirtualDevice {
            kind,
            device_nodes: vec![node],
            udev_events: vec![udev],
            hw_db_entries: hw_db,
        })
    }
}

/// A device appeared and has to be attached to a running session.
#[derive(Debug, Clone)]
pub struct PlugDeviceEvent {
    pub session_id: u64,
    pub udev_events: Vec<HashMap<String, String>>,
    pub hw_db_entries: Vec<(String, Vec<String>)>,
}

impl PlugDeviceEvent {
    pub fn from_device(session_id: u64, device: &VirtualDevice) -> Self {
        Self {
            session_id,
            udev_events: device.udev_events.clone(),
            hw_db_entries: device.hw_db_entries.clone(),
        }
    }

    /// Critical events survive queue overflow: they carry hwdb entries the
    /// guest cannot reconstruct from the device node alone.
    pub fn is_critical(&self) -> bool {
        !self.hw_db_entries.is_empty()
    }
}

/// A device went away.
#[derive(Debug, Clone)]
pub struct UnplugDeviceEvent {
    pub session_id: u64,
    pub udev_events: Vec<HashMap<String, String>>,
    pub hw_db_entries: Vec<(String, Vec<String>)>,
}

/// Bounded FIFO of hotplug events between the input side and the runner.
///
/// Producers never block; on overflow the oldest non-critical event is
/// dropped and logged. Each event is idempotent with respect to the guest,
/// so re-applying after a reconnect is harmless.
pub struct PlugQueue {
    capacity: usize,
    inner: Mutex<VecDeque<Arc<PlugDeviceEvent>>>,
    notify: Notify,
}

impl PlugQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Non-blocking push. Applies the overflow policy when full.
    pub fn try_push(&self, event: Arc<PlugDeviceEvent>) {
        {
            let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            while queue.len() >= self.capacity {
                match queue.iter().position(|ev| !ev.is_critical()) {
                    Some(pos) => {
                        let dropped = queue.remove(pos);
                        warn!(
                            "Plug queue full (capacity {}), dropped oldest non-critical event: {:?}",
                            self.capacity,
                            dropped.map(|d| d.session_id)
                        );
                    }
                    None => {
                        // every queued event is critical; let the queue grow
                        // past the bound rather than lose one
                        warn!(
                            "Plug queue over capacity ({}) with only critical events queued",
                            self.capacity
                        );
                        break;
                    }
                }
            }
            queue.push_back(event);
            debug!("Plug queue depth now {}", queue.len());
        }
        self.notify.notify_one();
    }

    /// Pop the next event, waiting up to `timeout` for one to arrive.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Arc<PlugDeviceEvent>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(ev) = {
                let mut queue = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
                queue.pop_front()
            } {
                return Some(ev);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
