//! Handler context
//!
//! The mutable per-connection state handed to [`RtspHandler`] callbacks.
//! Only the connection's own task ever holds it, so no locking is needed
//! here; everything cross-thread goes through the [`ClientHandle`].
//!
//! [`RtspHandler`]: crate::server::handler::RtspHandler

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::registry::{ClientHandle, ClientId, ClientRegistry, ClientWakeup};
use crate::session::rtp::RtpSession;
use crate::session::rtsp::RtspSession;
use crate::transport::TransportKind;
use crate::vhost::VirtualHost;

/// Per-connection state exposed to the RTSP layer
pub struct ClientContext {
    id: ClientId,
    transport: TransportKind,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    local_host: String,
    peer_host: String,
    vhost: Arc<VirtualHost>,
    handle: ClientHandle,
    registry: Arc<ClientRegistry>,
    session: Option<RtspSession>,
    channels: HashMap<u8, Arc<RtpSession>>,
}

impl ClientContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ClientId,
        transport: TransportKind,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        vhost: Arc<VirtualHost>,
        handle: ClientHandle,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            id,
            transport,
            local_addr,
            peer_addr,
            local_host: local_addr.ip().to_string(),
            peer_host: peer_addr.ip().to_string(),
            vhost,
            handle,
            registry,
            session: None,
            channels: HashMap::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Printable local host, cached at admission
    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Printable peer host, cached at admission
    pub fn peer_host(&self) -> &str {
        &self.peer_host
    }

    /// Virtual host this connection is charged against
    pub fn vhost(&self) -> &Arc<VirtualHost> {
        &self.vhost
    }

    /// Cross-thread handle of this connection
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Registry of live clients, e.g. for looking up the other half of an
    /// HTTP tunnel
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Stop-only back-reference for RTP sessions created on this connection
    pub fn wakeup(&self) -> ClientWakeup {
        self.handle.wakeup()
    }

    /// Queue (TCP) or directly send (SCTP control stream) a complete
    /// message; the buffer is owned by the transport from here on
    pub async fn write_data(&self, data: Bytes) -> Result<()> {
        self.handle.sink().send(data).await
    }

    /// Send a complete message on a specific SCTP stream
    #[cfg(feature = "sctp")]
    pub async fn write_data_on(&self, stream_id: u16, data: Bytes) -> Result<()> {
        self.handle.sink().send_on(stream_id, data).await
    }

    /// Shared RTSP session, if SETUP has happened
    pub fn session(&self) -> Option<&RtspSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut RtspSession> {
        self.session.as_mut()
    }

    /// Install the session created at SETUP
    pub fn set_session(&mut self, session: RtspSession) {
        self.session = Some(session);
    }

    pub fn take_session(&mut self) -> Option<RtspSession> {
        self.session.take()
    }

    /// Bind an interleaved channel id to an RTP session
    pub fn register_channel(&mut self, channel: u8, session: Arc<RtpSession>) -> Result<()> {
        if self.channels.contains_key(&channel) {
            return Err(Error::ChannelInUse(channel));
        }
        self.channels.insert(channel, session);
        Ok(())
    }

    /// RTP session bound to an interleaved channel id
    pub fn channel(&self, channel: u8) -> Option<Arc<RtpSession>> {
        self.channels.get(&channel).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::rtp::MediaSource;
    use crate::transport::OutboundSink;
    use tokio::sync::watch;

    fn test_context() -> ClientContext {
        let (stop, _) = watch::channel(false);
        let (sink, _rx) = OutboundSink::queued();
        let id = ClientId::new(1);
        let handle = ClientHandle::new(id, stop, sink);
        ClientContext::new(
            id,
            TransportKind::Tcp,
            "127.0.0.1:8554".parse().unwrap(),
            "192.168.1.50:40000".parse().unwrap(),
            Arc::new(VirtualHost::default()),
            handle,
            Arc::new(ClientRegistry::new()),
        )
    }

    #[test]
    fn test_host_strings_cached_from_addresses() {
        let ctx = test_context();
        assert_eq!(ctx.local_host(), "127.0.0.1");
        assert_eq!(ctx.peer_host(), "192.168.1.50");
        assert_eq!(ctx.transport(), TransportKind::Tcp);
    }

    #[test]
    fn test_session_absent_until_setup() {
        let mut ctx = test_context();
        assert!(ctx.session().is_none());

        ctx.set_session(RtspSession::new("abc"));
        assert_eq!(ctx.session().unwrap().id(), "abc");

        let taken = ctx.take_session().unwrap();
        assert_eq!(taken.id(), "abc");
        assert!(ctx.session().is_none());
    }

    #[test]
    fn test_register_channel_rejects_duplicates() {
        let mut ctx = test_context();
        let session = Arc::new(RtpSession::new(0, MediaSource::Live, ctx.wakeup()));

        ctx.register_channel(0, session.clone()).unwrap();
        assert_eq!(ctx.channel_count(), 1);
        assert_eq!(ctx.channel(0).unwrap().id(), 0);

        let err = ctx.register_channel(0, session).unwrap_err();
        assert!(matches!(err, Error::ChannelInUse(0)));
    }

    #[tokio::test]
    async fn test_write_data_reaches_sink() {
        let (stop, _) = watch::channel(false);
        let (sink, mut rx) = OutboundSink::queued();
        let id = ClientId::new(2);
        let handle = ClientHandle::new(id, stop, sink);
        let ctx = ClientContext::new(
            id,
            TransportKind::Tcp,
            "127.0.0.1:8554".parse().unwrap(),
            "127.0.0.1:40001".parse().unwrap(),
            Arc::new(VirtualHost::default()),
            handle,
            Arc::new(ClientRegistry::new()),
        );

        ctx.write_data(Bytes::from_static(b"RTSP/1.0 200 OK\r\n\r\n"))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Bytes::from_static(b"RTSP/1.0 200 OK\r\n\r\n")
        );
    }
}
