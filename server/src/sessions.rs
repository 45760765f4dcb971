//! Stream sessions and their registry.
//!
//! A [`StreamSession`] is created when a paired client calls `launch` and is
//! the unit every other subsystem keys on. The registry uniquely owns each
//! session; sub-services get shared non-owning access through event
//! payloads. Lock order across the host: HostStore ≺ SessionRegistry ≺
//! per-session joypad map.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use selene_types::{App, DisplayMode};
use tracing::{debug, info, warn};

use crate::devices::{PlugQueue, VirtualDevice, VirtualDisplayHandle};
use crate::error::HostError;
use crate::events::EventBus;

/// Runtime state of one active remote-play connection.
///
/// The input-device cells are write-once: the first writer installs the
/// device, every later observer sees that value until the session ends.
pub struct StreamSession {
    /// Unique for the whole host lifetime, never reused
    pub session_id: u64,
    pub client_ip: IpAddr,

    pub display_mode: DisplayMode,
    pub audio_channel_count: u32,

    /// GCM keys for audio encryption
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],

    pub video_port: u16,
    pub audio_port: u16,

    pub app: Arc<App>,
    pub app_state_folder: PathBuf,

    /// Every subsystem of a session observes this same bus instance
    pub event_bus: Arc<EventBus>,

    /// Hotplug events flowing from the input side to the runner
    pub plug_queue: Arc<PlugQueue>,

    /// Set while streaming, dropped with the session
    pub wayland_display: OnceLock<VirtualDisplayHandle>,

    // virtual devices, installed on first use
    pub mouse: OnceLock<VirtualDevice>,
    pub keyboard: OnceLock<VirtualDevice>,
    pub pen_tablet: OnceLock<VirtualDevice>,
    pub touch_screen: OnceLock<VirtualDevice>,

    /// Joypads keyed by controller number; add/remove are last-writer-wins
    pub joypads: RwLock<HashMap<u8, VirtualDevice>>,
}

impl StreamSession {
    /// Install a joypad for `controller_number`, replacing any previous one.
    pub fn set_joypad(&self, controller_number: u8, device: VirtualDevice) {
        let mut pads = self.joypads.write().unwrap_or_else(PoisonError::into_inner);
        pads.insert(controller_number, device);
    }

    pub fn remove_joypad(&self, controller_number: u8) -> Option<VirtualDevice> {
        let mut pads = self.joypads.write().unwrap_or_else(PoisonError::into_inner);
        pads.remove(&controller_number)
    }

    pub fn joypad_count(&self) -> usize {
        self.joypads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Node paths of every input device installed so far, in a stable order.
    pub fn virtual_input_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for cell in [&self.mouse, &self.keyboard, &self.pen_tablet, &self.touch_screen] {
            if let Some(device) = cell.get() {
                paths.extend(device.device_nodes.iter().cloned());
            }
        }
        let pads = self.joypads.read().unwrap_or_else(PoisonError::into_inner);
        let mut numbers: Vec<&u8> = pads.keys().collect();
        numbers.sort();
        for n in numbers {
            paths.extend(pads[n].device_nodes.iter().cloned());
        }
        paths
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("session_id", &self.session_id)
            .field("client_ip", &self.client_ip)
            .field("app", &self.app.id)
            .field("video_port", &self.video_port)
            .field("audio_port", &self.audio_port)
            .finish()
    }
}

/// Owner of all live sessions, keyed by session id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, Arc<StreamSession>>>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next session id. Monotonic, never reused.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, session: Arc<StreamSession>) {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        info!(
            "Registered session {} for {} (app {})",
            session.session_id, session.client_ip, session.app.id
        );
        sessions.insert(session.session_id, session);
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<StreamSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned()
    }

    pub fn contains(&self, session_id: u64) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&session_id)
    }

    /// Remove a session. Stop propagation removes the entry first, so no
    /// event for this id can reach a subscriber that registers afterwards.
    pub fn remove(&self, session_id: u64) -> Option<Arc<StreamSession>> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = sessions.remove(&session_id);
        if removed.is_some() {
            debug!("Removed session {} from registry", session_id);
        }
        removed
    }

    /// The most recent session established from `ip`. RTSP and stream pings
    /// correlate to sessions by source address.
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<Arc<StreamSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.client_ip == ip)
            .max_by_key(|s| s.session_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<StreamSession>> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.session_id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pool of UDP ports handed to sessions for their video and audio streams.
pub struct PortPool {
    free: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            free: Mutex::new(range.collect()),
        }
    }

    /// Allocate a (video, audio) port pair.
    pub fn allocate_pair(&self) -> Result<(u16, u16), HostError> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        let video = *free
            .iter()
            .next()
            .ok_or_else(|| HostError::ResourceExhausted("no free UDP stream ports".into()))?;
        free.remove(&video);
        let audio = match free.iter().next() {
            Some(&p) => p,
            None => {
                // put the first one back, the pair could not be satisfied
                free.insert(video);
                return Err(HostError::ResourceExhausted(
                    "no free UDP stream ports".into(),
                ));
            }
        };
        free.remove(&audio);
        Ok((video, audio))
    }

    pub fn release(&self, port: u16) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if !free.insert(port) {
            warn!("Port {} released twice", port);
        }
    }

    pub fn available(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::devices::{InputBackend, InputDeviceKind, SimulatedInputBackend};
    use selene_types::RunnerConfig;

    pub(crate) fn test_session(registry: &SessionRegistry, ip: &str) -> Arc<StreamSession> {
        let app = Arc::new(App {
            id: "app".into(),
            title: "App".into(),
            image_path: None,
            support_hdr: false,
            h264_pipeline: "videotestsrc".into(),
            hevc_pipeline: None,
            av1_pipeline: None,
            opus_pipeline: "audiotestsrc".into(),
            render_node: String::new(),
            start_virtual_compositor: false,
            joypad_kind: Default::default(),
            runner: RunnerConfig::Process {
                run_cmd: "true".into(),
            },
        });
        Arc::new(StreamSession {
            session_id: registry.allocate_id(),
            client_ip: ip.parse().unwrap(),
            display_mode: DisplayMode::default(),
            audio_channel_count: 2,
            aes_key: [0u8; 16],
            aes_iv: [0u8; 16],
            video_port: 48100,
            audio_port: 48101,
            app,
            app_state_folder: PathBuf::from("/tmp"),
            event_bus: EventBus::new(),
            plug_queue: Arc::new(PlugQueue::new(16)),
            wayland_display: OnceLock::new(),
            mouse: OnceLock::new(),
            keyboard: OnceLock::new(),
            pen_tablet: OnceLock::new(),
            touch_screen: OnceLock::new(),
            joypads: RwLock::new(HashMap::new()),
        })
    }

    #[test]
    fn session_ids_are_never_reused() {
        let registry = SessionRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let session = test_session(&registry, "10.0.0.2");
            registry.insert(session.clone());
            registry.remove(session.session_id);
            assert!(seen.insert(session.session_id), "id reused");
        }
    }

    #[test]
    fn find_by_ip_prefers_latest_session() {
        let registry = SessionRegistry::new();
        let older = test_session(&registry, "10.0.0.2");
        let newer = test_session(&registry, "10.0.0.2");
        registry.insert(older);
        registry.insert(newer.clone());

        let found = registry.find_by_ip("10.0.0.2".parse().unwrap()).unwrap();
        assert_eq!(found.session_id, newer.session_id);
        assert!(registry.find_by_ip("10.0.0.9".parse().unwrap()).is_none());
    }

    #[test]
    fn input_cells_are_write_once() {
        let registry = SessionRegistry::new();
        let session = test_session(&registry, "10.0.0.2");
        let backend = SimulatedInputBackend;

        let first = backend.create(InputDeviceKind::Mouse).unwrap();
        assert!(session.mouse.set(first).is_ok());
        // a second writer loses; the first value stays installed
        let second = backend.create(InputDeviceKind::Mouse).unwrap();
        assert!(session.mouse.set(second).is_err());
        assert!(session.mouse.get().is_some());
    }

    #[test]
    fn joypad_map_is_last_writer_wins_per_key() {
        let registry = SessionRegistry::new();
        let session = test_session(&registry, "10.0.0.2");
        let backend = SimulatedInputBackend;

        let xbox = backend
            .create(InputDeviceKind::Joypad(selene_types::ControllerKind::Xbox))
            .unwrap();
        let ps = backend
            .create(InputDeviceKind::Joypad(selene_types::ControllerKind::Ps))
            .unwrap();
        session.set_joypad(0, xbox);
        session.set_joypad(0, ps.clone());
        assert_eq!(session.joypad_count(), 1);

        session.set_joypad(1, ps);
        assert_eq!(session.joypad_count(), 2);
        session.remove_joypad(1);
        assert_eq!(session.joypad_count(), 1);
    }

    #[test]
    fn port_pool_exhaustion_and_release() {
        let pool = PortPool::new(48100..48103);
        let (v, a) = pool.allocate_pair().unwrap();
        assert_ne!(v, a);
        // one port left, a pair cannot be satisfied
        assert!(matches!(
            pool.allocate_pair(),
            Err(HostError::ResourceExhausted(_))
        ));
        assert_eq!(pool.available(), 1);

        pool.release(v);
        pool.release(a);
        assert_eq!(pool.available(), 3);
        pool.allocate_pair().unwrap();
    }
}
