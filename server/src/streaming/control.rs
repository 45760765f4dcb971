//! Control sub-session.
//!
//! The control transport itself (the encrypted client channel) is outside
//! the core; this is the session-scoped service it drives: creating virtual
//! input devices on first use, hotplugging joypads, and relaying stream
//! recovery requests.

use std::sync::{Arc, OnceLock};

use selene_types::ControllerKind;
use tracing::{debug, info, warn};

use crate::devices::{InputBackend, InputDeviceKind, PlugDeviceEvent, UnplugDeviceEvent, VirtualDevice};
use crate::error::HostError;
use crate::events::SessionEvent;
use crate::sessions::StreamSession;

/// Per-session control surface.
pub struct SessionControl {
    session: Arc<StreamSession>,
    input: Arc<dyn InputBackend>,
}

impl SessionControl {
    pub fn new(session: Arc<StreamSession>, input: Arc<dyn InputBackend>) -> Self {
        Self { session, input }
    }

    /// Create-and-install for the write-once cells. The first caller plugs
    /// the device; everyone else gets the installed one.
    fn ensure<'a>(
        &'a self,
        cell: &'a OnceLock<VirtualDevice>,
        kind: InputDeviceKind,
    ) -> Result<&'a VirtualDevice, HostError> {
        if let Some(device) = cell.get() {
            return Ok(device);
        }
        let created = self.input.create(kind)?;
        match cell.set(created) {
            Ok(()) => {
                let device = cell.get().unwrap_or_else(|| unreachable!("cell just set"));
                info!(
                    "[session {}] created {:?} on first use",
                    self.session.session_id, kind
                );
                self.plug(device);
                Ok(device)
            }
            Err(_lost_race) => {
                // another caller installed first; theirs wins
                debug!(
                    "[session {}] {:?} already installed, dropping duplicate",
                    self.session.session_id, kind
                );
                Ok(cell.get().unwrap_or_else(|| unreachable!("cell is set")))
            }
        }
    }

    pub fn ensure_mouse(&self) -> Result<&VirtualDevice, HostError> {
        self.ensure(&self.session.mouse, InputDeviceKind::Mouse)
    }

    pub fn ensure_keyboard(&self) -> Result<&VirtualDevice, HostError> {
        self.ensure(&self.session.keyboard, InputDeviceKind::Keyboard)
    }

    pub fn ensure_pen_tablet(&self) -> Result<&VirtualDevice, HostError> {
        self.ensure(&self.session.pen_tablet, InputDeviceKind::PenTablet)
    }

    pub fn ensure_touch_screen(&self) -> Result<&VirtualDevice, HostError> {
        self.ensure(&self.session.touch_screen, InputDeviceKind::TouchScreen)
    }

    /// Attach a joypad for a controller slot. Replaces whatever was there.
    pub fn add_joypad(&self, controller_number: u8) -> Result<(), HostError> {
        let kind = match self.session.app.joypad_kind {
            ControllerKind::Auto => ControllerKind::Xbox,
            explicit => explicit,
        };
        let device = self.input.create(InputDeviceKind::Joypad(kind))?;
        self.plug(&device);
        self.session.set_joypad(controller_number, device);
        info!(
            "[session {}] joypad {} attached ({:?})",
            self.session.session_id, controller_number, kind
        );
        Ok(())
    }

    /// Detach a joypad, announcing the unplug to the runner side.
    pub fn remove_joypad(&self, controller_number: u8) {
        match self.session.remove_joypad(controller_number) {
            Some(device) => {
                self.session
                    .event_bus
                    .publish(SessionEvent::UnplugDevice(Arc::new(UnplugDeviceEvent {
                        session_id: self.session.session_id,
                        udev_events: device.udev_events,
                        hw_db_entries: device.hw_db_entries,
                    })));
            }
            None => warn!(
                "[session {}] remove for unknown joypad {}",
                self.session.session_id, controller_number
            ),
        }
    }

    /// Client-side stream corruption: ask for a recovery IDR frame.
    pub fn request_recovery(&self) {
        self.session.event_bus.publish(SessionEvent::IdrRequest {
            session_id: self.session.session_id,
        });
    }

    /// Client asked to end the stream.
    pub fn request_termination(&self) {
        self.session.event_bus.publish(SessionEvent::StopStream {
            session_id: self.session.session_id,
        });
    }

    fn plug(&self, device: &VirtualDevice) {
        let event = Arc::new(PlugDeviceEvent::from_device(
            self.session.session_id,
            device,
        ));
        self.session.plug_queue.try_push(event.clone());
        self.session
            .event_bus
            .publish(SessionEvent::PlugDevice(event));
    }
}
