//! Typed event bus coupling the host's subsystems.
//!
//! The event set is closed: every kind the host can publish is a variant of
//! [`SessionEvent`]. Dispatch is synchronous on the publisher's thread, in
//! registration order, and a panicking handler never prevents delivery to
//! the remaining handlers. Long-lived subsystems subscribe through
//! [`EventBus::subscribe_channel`] and consume from their own task, so no
//! handler ever publishes re-entrantly.

use std::collections::HashMap;
use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use selene_types::{AudioMode, ColorRange, ColorSpace, DisplayMode};
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

use crate::devices::{PlugDeviceEvent, UnplugDeviceEvent};
use crate::sessions::StreamSession;

/// A pairing handshake started and needs a PIN from the user.
#[derive(Debug)]
pub struct PairRequested {
    pub client_ip: IpAddr,
    pub host_ip: IpAddr,
    /// Opaque handle the admin API uses to route the PIN back
    pub pair_secret: String,
    pin_tx: Mutex<Option<oneshot::Sender<String>>>,
}

impl PairRequested {
    pub fn new(
        client_ip: IpAddr,
        host_ip: IpAddr,
        pair_secret: String,
    ) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                client_ip,
                host_ip,
                pair_secret,
                pin_tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Fulfill the PIN promise. Single-shot: only the first call wins.
    pub fn fulfill(&self, pin: String) -> bool {
        let mut guard = self.pin_tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(tx) => tx.send(pin).is_ok(),
            None => false,
        }
    }
}

/// Parameters a video pipeline starter needs, produced by RTSP negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSessionParams {
    pub session_id: u64,
    pub display_mode: DisplayMode,
    /// Fully rendered pipeline description for the media engine
    pub pipeline: String,

    pub port: u16,
    pub timeout_ms: i64,

    pub packet_size: i64,
    pub frames_with_invalid_ref_threshold: i64,
    pub fec_percentage: i64,
    pub min_required_fec_packets: i64,
    pub bitrate_kbps: i64,
    pub slices_per_frame: i64,

    pub color_range: ColorRange,
    pub color_space: ColorSpace,

    pub client_ip: IpAddr,
}

/// Parameters an audio pipeline starter needs, produced by RTSP negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSessionParams {
    pub session_id: u64,
    pub pipeline: String,

    pub encrypt_audio: bool,
    pub aes_key: [u8; 16],
    pub aes_iv: [u8; 16],

    pub port: u16,
    pub client_ip: IpAddr,

    pub packet_duration_ms: i64,
    pub audio_mode: AudioMode,
}

/// Source address observed on a stream port (NAT traversal ping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingInfo {
    pub client_ip: IpAddr,
    pub client_port: u16,
}

/// The closed set of event kinds handlers can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PairRequested,
    PlugDevice,
    UnplugDevice,
    StreamSessionCreated,
    VideoSessionReady,
    AudioSessionReady,
    IdrRequest,
    PauseStream,
    ResumeStream,
    StopStream,
    RtpVideoPing,
    RtpAudioPing,
}

/// An event travelling over the bus. Cheap to clone; payloads are shared,
/// immutable and may be retained by handlers.
#[derive(Clone)]
pub enum SessionEvent {
    PairRequested(Arc<PairRequested>),
    PlugDevice(Arc<PlugDeviceEvent>),
    UnplugDevice(Arc<UnplugDeviceEvent>),
    StreamSessionCreated(Arc<StreamSession>),
    VideoSessionReady(Arc<VideoSessionParams>),
    AudioSessionReady(Arc<AudioSessionParams>),
    IdrRequest { session_id: u64 },
    PauseStream { session_id: u64 },
    ResumeStream { session_id: u64 },
    StopStream { session_id: u64 },
    RtpVideoPing(PingInfo),
    RtpAudioPing(PingInfo),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::PairRequested(_) => EventKind::PairRequested,
            SessionEvent::PlugDevice(_) => EventKind::PlugDevice,
            SessionEvent::UnplugDevice(_) => EventKind::UnplugDevice,
            SessionEvent::StreamSessionCreated(_) => EventKind::StreamSessionCreated,
            SessionEvent::VideoSessionReady(_) => EventKind::VideoSessionReady,
            SessionEvent::AudioSessionReady(_) => EventKind::AudioSessionReady,
            SessionEvent::IdrRequest { .. } => EventKind::IdrRequest,
            SessionEvent::PauseStream { .. } => EventKind::PauseStream,
            SessionEvent::ResumeStream { .. } => EventKind::ResumeStream,
            SessionEvent::StopStream { .. } => EventKind::StopStream,
            SessionEvent::RtpVideoPing(_) => EventKind::RtpVideoPing,
            SessionEvent::RtpAudioPing(_) => EventKind::RtpAudioPing,
        }
    }

    /// The session the event belongs to, when it is session-scoped.
    pub fn session_id(&self) -> Option<u64> {
        match self {
            SessionEvent::PlugDevice(ev) => Some(ev.session_id),
            SessionEvent::UnplugDevice(ev) => Some(ev.session_id),
            SessionEvent::StreamSessionCreated(s) => Some(s.session_id),
            SessionEvent::VideoSessionReady(p) => Some(p.session_id),
            SessionEvent::AudioSessionReady(p) => Some(p.session_id),
            SessionEvent::IdrRequest { session_id }
            | SessionEvent::PauseStream { session_id }
            | SessionEvent::ResumeStream { session_id }
            | SessionEvent::StopStream { session_id } => Some(*session_id),
            SessionEvent::PairRequested(_)
            | SessionEvent::RtpVideoPing(_)
            | SessionEvent::RtpAudioPing(_) => None,
        }
    }
}

type Handler = Box<dyn Fn(&SessionEvent) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<HandlerEntry>>,
}

/// Publish/subscribe registry over the closed event set.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver `event` to every handler registered for its kind, in
    /// registration order, on the calling thread. The bus lock is held for
    /// the whole dispatch, which is what makes unsubscription immediate.
    pub fn publish(&self, event: SessionEvent) {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = inner.handlers.get(&event.kind()) else {
            trace!("No handlers for {:?}", event.kind());
            return;
        };
        for entry in entries {
            if catch_unwind(AssertUnwindSafe(|| (entry.handler)(&event))).is_err() {
                error!(
                    "Handler {} for {:?} panicked; continuing delivery",
                    entry.id,
                    event.kind()
                );
            }
        }
    }

    /// Register `handler` for `kind`. The returned handle unregisters on
    /// drop; after the drop returns, no further deliveries happen.
    pub fn subscribe<F>(self: &Arc<Self>, kind: EventKind, handler: F) -> Registration
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handlers.entry(kind).or_default().push(HandlerEntry {
            id,
            handler: Box::new(handler),
        });
        Registration {
            bus: Arc::downgrade(self),
            kind,
            id,
        }
    }

    /// Register a forwarding handler and get the receiving end of a channel.
    ///
    /// This is how long-lived subsystems consume the bus: the handler only
    /// enqueues, the subsystem's own task does the work.
    pub fn subscribe_channel(
        self: &Arc<Self>,
        kind: EventKind,
    ) -> (Registration, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reg = self.subscribe(kind, move |ev| {
            // receiver may be gone during shutdown
            let _ = tx.send(ev.clone());
        });
        (reg, rx)
    }

    /// Like [`subscribe_channel`](Self::subscribe_channel) but feeding one
    /// channel from several kinds. Per-kind ordering follows publish order.
    pub fn subscribe_channel_many(
        self: &Arc<Self>,
        kinds: &[EventKind],
    ) -> (Vec<Registration>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let regs = kinds
            .iter()
            .map(|kind| {
                let tx = tx.clone();
                self.subscribe(*kind, move |ev| {
                    // receiver may be gone during shutdown
                    let _ = tx.send(ev.clone());
                })
            })
            .collect();
        (regs, rx)
    }

    fn unsubscribe(&self, kind: EventKind, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = inner.handlers.get_mut(&kind) {
            entries.retain(|e| e.id != id);
        }
    }

    /// Number of handlers currently registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.handlers.get(&kind).map(|e| e.len()).unwrap_or(0)
    }
}

/// Subscription handle. Dropping it unregisters the handler.
///
/// Must not be dropped from inside a handler running on the same bus.
pub struct Registration {
    bus: Weak<EventBus>,
    kind: EventKind,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.kind, self.id);
        } else {
            warn!("Event bus dropped before handler {} unregistered", self.id);
        }
    }
}
