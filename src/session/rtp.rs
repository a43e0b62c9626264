//! RTP session records
//!
//! The connection core does not schedule media; it only watches these
//! records for stream timeouts. Producer tasks stamp
//! `last_packet_send_time` whenever they put a packet on the wire, from
//! whatever thread they run on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::registry::ClientWakeup;

/// Milliseconds since the unix epoch
pub(crate) fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Where a media stream originates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSource {
    /// Produced in real time (live encoder); goes silent when the producer
    /// stops, which is what the soft BYE is for
    Live,
    /// Read from a file
    Stored,
}

/// One RTP media stream attached to a client's session
#[derive(Debug)]
pub struct RtpSession {
    id: u32,
    source: MediaSource,
    /// Unix millis of the last packet put on the wire
    last_packet_send_time: AtomicU64,
    byes_sent: AtomicU64,
    client: ClientWakeup,
}

impl RtpSession {
    /// Create a session record; the send time starts at "now"
    pub fn new(id: u32, source: MediaSource, client: ClientWakeup) -> Self {
        Self {
            id,
            source,
            last_packet_send_time: AtomicU64::new(now_unix_millis()),
            byes_sent: AtomicU64::new(0),
            client,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn source(&self) -> MediaSource {
        self.source
    }

    /// Record that a packet was just sent
    pub fn mark_packet_sent(&self) {
        self.last_packet_send_time
            .store(now_unix_millis(), Ordering::Relaxed);
    }

    /// Unix millis of the last packet sent
    pub fn last_packet_send_time(&self) -> u64 {
        self.last_packet_send_time.load(Ordering::Relaxed)
    }

    /// Overwrite the last-send stamp (unix millis)
    pub fn set_last_packet_send_time(&self, millis: u64) {
        self.last_packet_send_time.store(millis, Ordering::Relaxed);
    }

    /// How long this stream has been silent, as of `now` (unix millis)
    pub fn idle_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_packet_send_time())
    }

    pub(crate) fn record_bye(&self) {
        self.byes_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of RTCP BYEs emitted for this stream
    pub fn byes_sent(&self) -> u64 {
        self.byes_sent.load(Ordering::Relaxed)
    }

    /// Owning client, reachable only for loop wakeup
    pub fn client(&self) -> &ClientWakeup {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ClientHandle, ClientId};
    use crate::transport::OutboundSink;
    use tokio::sync::watch;

    fn test_wakeup() -> ClientWakeup {
        let (stop, _) = watch::channel(false);
        let (sink, _rx) = OutboundSink::queued();
        ClientHandle::new(ClientId::new(1), stop, sink).wakeup()
    }

    #[test]
    fn test_idle_time() {
        let session = RtpSession::new(0, MediaSource::Live, test_wakeup());
        session.set_last_packet_send_time(10_000);

        assert_eq!(session.idle_millis(17_000), 7_000);
        // Clock going backwards must not underflow
        assert_eq!(session.idle_millis(9_000), 0);
    }

    #[test]
    fn test_mark_packet_sent_resets_idle() {
        let session = RtpSession::new(0, MediaSource::Stored, test_wakeup());
        session.set_last_packet_send_time(0);
        assert!(session.idle_millis(now_unix_millis()) > 0);

        session.mark_packet_sent();
        assert!(session.idle_millis(now_unix_millis()) < 1_000);
    }

    #[test]
    fn test_bye_counter() {
        let session = RtpSession::new(3, MediaSource::Live, test_wakeup());
        assert_eq!(session.byes_sent(), 0);

        session.record_bye();
        session.record_bye();
        assert_eq!(session.byes_sent(), 2);
    }

    #[test]
    fn test_client_backref_stops_owner_only() {
        let (stop, _) = watch::channel(false);
        let (sink, _rx) = OutboundSink::queued();
        let handle = ClientHandle::new(ClientId::new(4), stop, sink);

        let session = RtpSession::new(0, MediaSource::Live, handle.wakeup());
        session.client().stop();
        assert!(handle.is_stopped());
    }
}
