//! UDP ping listeners on the session stream ports.
//!
//! Moonlight clients fire a short PING datagram at the video and audio
//! ports to punch NAT holes before the RTP flow starts; the observed source
//! address is what the packetizer has to send to.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::events::{EventBus, PingInfo, SessionEvent};

/// Which stream port the listener watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPingKind {
    Video,
    Audio,
}

/// Consume datagrams on `socket`, publishing a ping event for every PING
/// payload, until cancelled.
pub async fn run_ping_listener(
    bus: Arc<EventBus>,
    kind: StreamPingKind,
    socket: UdpSocket,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                if !buf[..len].starts_with(b"PING") {
                    trace!("Non-ping datagram ({} bytes) from {}", len, from);
                    continue;
                }
                debug!("{:?} ping from {}", kind, from);
                let info = PingInfo {
                    client_ip: from.ip(),
                    client_port: from.port(),
                };
                let event = match kind {
                    StreamPingKind::Video => SessionEvent::RtpVideoPing(info),
                    StreamPingKind::Audio => SessionEvent::RtpAudioPing(info),
                };
                bus.publish(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::time::Duration;

    #[tokio::test]
    async fn ping_datagrams_become_events() {
        let bus = EventBus::new();
        let (_reg, mut rx) = bus.subscribe_channel(EventKind::RtpVideoPing);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_ping_listener(
            bus.clone(),
            StreamPingKind::Video,
            socket,
            cancel.clone(),
        ));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"not a ping", addr).await.unwrap();
        sender.send_to(b"PING", addr).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::RtpVideoPing(info) => {
                assert_eq!(info.client_port, sender.local_addr().unwrap().port());
            }
            other => panic!("unexpected event {:?}", other.kind()),
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
