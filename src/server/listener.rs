//! RTSP connection listener
//!
//! Binds the control sockets, accepts incoming connections, classifies
//! their transport and admits them: building the per-client state and
//! spawning the task that owns it. Accept-path failures are logged and
//! dropped; they never disturb connections already being served.

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::error::Result;
use crate::registry::{ClientHandle, ClientId, ClientRegistry};
use crate::server::client::{Client, ClientTransport};
use crate::server::config::ServerConfig;
use crate::server::handler::RtspHandler;
use crate::session::ClientContext;
use crate::stats::ServerStats;
use crate::transport::{OutboundSink, TransportKind};
use crate::vhost::VirtualHost;

/// RTSP server: listener, admission and the shared client bookkeeping
pub struct RtspServer<H: RtspHandler> {
    config: ServerConfig,
    handler: Arc<H>,
    registry: Arc<ClientRegistry>,
    default_vhost: Arc<VirtualHost>,
    stats: Arc<ServerStats>,
    next_client_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    bound_addr: OnceLock<SocketAddr>,
}

impl<H: RtspHandler> RtspServer<H> {
    /// Create a new server with the given configuration and handler
    pub fn new(config: ServerConfig, handler: H) -> Result<Self> {
        config.validate()?;

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Ok(Self {
            config,
            handler: Arc::new(handler),
            registry: Arc::new(ClientRegistry::new()),
            default_vhost: Arc::new(VirtualHost::default()),
            stats: Arc::new(ServerStats::new()),
            next_client_id: AtomicU64::new(1),
            connection_semaphore,
            bound_addr: OnceLock::new(),
        })
    }

    /// Registry of live clients
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Virtual host new connections are admitted under
    pub fn default_vhost(&self) -> &Arc<VirtualHost> {
        &self.default_vhost
    }

    /// Connection counters
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Address of the TCP control listener: the OS-assigned address once
    /// the listener is up, the configured one before that. Binding to
    /// port 0 and reading this back gives tests a collision-free port.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bound_addr
            .get()
            .copied()
            .unwrap_or(self.config.bind_addr)
    }

    /// Run the server
    ///
    /// This method blocks until the listener fails to bind; accept errors
    /// are logged and absorbed.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let _ = self.bound_addr.set(listener.local_addr()?);
        tracing::info!(addr = %self.bind_addr(), "RTSP server listening");

        #[cfg(feature = "sctp")]
        if let Some(sctp_addr) = self.config.sctp_bind_addr {
            let sctp_listener = crate::transport::sctp::SctpListener::bind(sctp_addr)?;
            tracing::info!(addr = %sctp_addr, "RTSP SCTP listener bound");

            tokio::select! {
                result = self.accept_loop(&listener) => return result,
                result = self.sctp_accept_loop(&sctp_listener) => return result,
            }
        }

        self.accept_loop(&listener).await
    }

    /// Run the server with graceful shutdown
    ///
    /// When `shutdown` completes, every live client is asked to stop and
    /// tears itself down on its own task.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                self.shutdown();
                Ok(())
            }
            result = self.run() => result,
        }
    }

    /// Broadcast a loop stop to every live client
    pub fn shutdown(&self) {
        self.registry.shutdown();
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => self.admit_tcp(socket, peer_addr),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn admit_tcp(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(peer = %peer_addr, error = %e, "getsockname failed");
                return;
            }
        };

        let Ok(permit) = self.acquire_slot(peer_addr) else {
            return;
        };

        tracing::info!(
            fd = socket.as_raw_fd(),
            peer = %peer_addr,
            "Incoming connection accepted"
        );

        let (sink, out_rx) = OutboundSink::queued();
        self.spawn_client(
            TransportKind::Tcp,
            local_addr,
            peer_addr,
            sink,
            ClientTransport::Tcp {
                stream: socket,
                out_rx,
            },
            permit,
        );
    }

    #[cfg(feature = "sctp")]
    async fn sctp_accept_loop(
        &self,
        listener: &crate::transport::sctp::SctpListener,
    ) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => self.admit_sctp(socket, peer_addr),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept SCTP association");
                }
            }
        }
    }

    #[cfg(feature = "sctp")]
    fn admit_sctp(&self, socket: crate::transport::sctp::SctpSocket, peer_addr: SocketAddr) {
        use crate::error::Error;

        // The listener fixes the protocol, but ask the kernel what the
        // accepted socket actually speaks and reject anything else rather
        // than admit a client with no usable write strategy.
        match socket.protocol() {
            Ok(proto) if proto == Some(socket2::Protocol::from(libc::IPPROTO_SCTP)) => {}
            Ok(proto) => {
                let raw: i32 = proto.map(Into::into).unwrap_or(-1);
                tracing::error!(
                    peer = %peer_addr,
                    error = %Error::UnknownProtocol(raw),
                    "Rejecting connection"
                );
                return;
            }
            Err(e) => {
                tracing::error!(peer = %peer_addr, error = %e, "getsockopt failed");
                return;
            }
        }

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(peer = %peer_addr, error = %e, "getsockname failed");
                return;
            }
        };

        let Ok(permit) = self.acquire_slot(peer_addr) else {
            return;
        };

        tracing::info!(
            fd = socket.as_raw_fd(),
            peer = %peer_addr,
            "Incoming connection accepted"
        );

        let socket = Arc::new(socket);
        let sink = OutboundSink::Sctp(socket.clone());
        self.spawn_client(
            TransportKind::Sctp,
            local_addr,
            peer_addr,
            sink,
            ClientTransport::Sctp { socket },
            permit,
        );
    }

    /// Claim a connection slot, or refuse the connection
    fn acquire_slot(
        &self,
        peer_addr: SocketAddr,
    ) -> std::result::Result<Option<OwnedSemaphorePermit>, ()> {
        match &self.connection_semaphore {
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    Err(())
                }
            },
            None => Ok(None),
        }
    }

    fn spawn_client(
        &self,
        transport_kind: TransportKind,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        sink: OutboundSink,
        transport: ClientTransport,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let id = ClientId::new(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = ClientHandle::new(id, stop_tx, sink);

        let ctx = ClientContext::new(
            id,
            transport_kind,
            local_addr,
            peer_addr,
            self.default_vhost.clone(),
            handle,
            self.registry.clone(),
        );

        self.default_vhost.connection_opened();
        self.stats.connection_opened();

        let client = Client {
            ctx,
            transport,
            stop_rx,
            handler: self.handler.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            config: self.config.clone(),
            permit,
        };

        tokio::spawn(client.run());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::session::rtp::now_unix_millis;
    use crate::session::{MediaSource, RtpSession, RtspSession};

    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::{Bytes, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time;

    /// Loopback with an OS-assigned port, read back via `bind_addr()`
    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn start_server<H: RtspHandler>(config: ServerConfig, handler: H) -> Arc<RtspServer<H>> {
        let server = Arc::new(RtspServer::new(config, handler).unwrap());
        let runner = server.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        wait_for("listener bound", || server.bind_addr().port() != 0).await;
        server
    }

    async fn connect(port: u16) -> TcpStream {
        for _ in 0..200 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
                return stream;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        panic!("could not connect to 127.0.0.1:{port}");
    }

    async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Handler that fails every request as malformed
    struct RejectGarbage;

    #[async_trait]
    impl RtspHandler for RejectGarbage {
        async fn on_data(&self, _ctx: &mut ClientContext, _buf: &mut BytesMut) -> Result<bool> {
            Err(Error::Protocol("malformed request".into()))
        }
    }

    #[tokio::test]
    async fn test_accept_then_parser_error_tears_down() {
        let server = start_server(ServerConfig::with_addr(loopback()), RejectGarbage).await;
        let port = server.bind_addr().port();

        let mut stream = connect(port).await;
        let registry = server.registry().clone();
        wait_for("client registered", || registry.len() == 1).await;
        assert_eq!(server.default_vhost().connection_count(), 1);

        // One malformed byte is enough for the parser to give up
        stream.write_all(b"\xff").await.unwrap();

        wait_for("client removed", || registry.is_empty()).await;
        assert_eq!(server.default_vhost().connection_count(), 0);

        let snap = server.stats().snapshot();
        assert_eq!(snap.total_connections, 1);
        assert_eq!(snap.active_connections, 0);

        // Server side closed the socket
        let mut buf = [0u8; 16];
        let n = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    /// Handler that answers any input with three queued messages
    struct WriteBack;

    #[async_trait]
    impl RtspHandler for WriteBack {
        async fn on_data(&self, ctx: &mut ClientContext, buf: &mut BytesMut) -> Result<bool> {
            buf.clear();
            ctx.write_data(Bytes::from_static(b"one")).await?;
            ctx.write_data(Bytes::from_static(b"two")).await?;
            ctx.write_data(Bytes::from_static(b"three")).await?;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_queued_writes_arrive_in_order() {
        let server = start_server(ServerConfig::with_addr(loopback()), WriteBack).await;
        let port = server.bind_addr().port();

        let mut stream = connect(port).await;
        stream.write_all(b"x").await.unwrap();

        let mut buf = [0u8; 11];
        time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"onetwothree");
    }

    /// Handler that links the first two connections as an HTTP tunnel pair
    /// (first in = GET side, second = POST side carrying RTSP)
    struct PairUp {
        seen: StdMutex<Vec<ClientHandle>>,
    }

    #[async_trait]
    impl RtspHandler for PairUp {
        async fn on_connection(&self, ctx: &ClientContext) -> bool {
            let mut seen = self.seen.lock().unwrap();
            seen.push(ctx.handle().clone());
            if seen.len() == 2 {
                ClientHandle::link_http_pair(&seen[1], &seen[0]);
            }
            true
        }
    }

    #[tokio::test]
    async fn test_tunnel_pair_post_side_takes_both_down() {
        let server = start_server(
            ServerConfig::with_addr(loopback()),
            PairUp {
                seen: StdMutex::new(Vec::new()),
            },
        )
        .await;
        let port = server.bind_addr().port();
        let registry = server.registry().clone();

        let mut get_side = connect(port).await;
        wait_for("GET side registered", || registry.len() == 1).await;
        let post_side = connect(port).await;
        wait_for("POST side registered", || registry.len() == 2).await;

        // Dropping the RTSP-carrying side stops its sibling as well
        drop(post_side);
        wait_for("both sides removed", || registry.is_empty()).await;
        assert_eq!(server.default_vhost().connection_count(), 0);

        // The GET side's socket was closed under it
        let mut buf = [0u8; 16];
        let n = time::timeout(Duration::from_secs(5), get_side.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_tunnel_pair_get_side_leaves_post_running() {
        let server = start_server(
            ServerConfig::with_addr(loopback()),
            PairUp {
                seen: StdMutex::new(Vec::new()),
            },
        )
        .await;
        let port = server.bind_addr().port();
        let registry = server.registry().clone();

        let get_side = connect(port).await;
        wait_for("GET side registered", || registry.len() == 1).await;
        let post_side = connect(port).await;
        wait_for("POST side registered", || registry.len() == 2).await;

        // The GET side going away must not take the RTSP side with it
        drop(get_side);
        wait_for("GET side removed", || registry.len() == 1).await;
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(registry.len(), 1);

        drop(post_side);
        wait_for("POST side removed", || registry.is_empty()).await;
        assert_eq!(server.default_vhost().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_shutdown_drains_all_clients() {
        let server =
            start_server(ServerConfig::with_addr(loopback()), crate::LoggingHandler).await;
        let port = server.bind_addr().port();
        let registry = server.registry().clone();

        let mut streams = Vec::new();
        for _ in 0..100 {
            streams.push(connect(port).await);
        }
        wait_for("all clients registered", || registry.len() == 100).await;
        assert_eq!(server.default_vhost().connection_count(), 100);

        server.shutdown();

        wait_for("registry drained", || registry.is_empty()).await;
        assert_eq!(server.default_vhost().connection_count(), 0);
        assert_eq!(server.stats().snapshot().active_connections, 0);
    }

    /// Handler that attaches a long-silent live stream on first input
    struct IdleStream {
        rtp: StdMutex<Option<Arc<RtpSession>>>,
    }

    #[async_trait]
    impl RtspHandler for IdleStream {
        async fn on_data(&self, ctx: &mut ClientContext, buf: &mut BytesMut) -> Result<bool> {
            buf.clear();
            if ctx.session().is_none() {
                let rtp = Arc::new(RtpSession::new(0, MediaSource::Live, ctx.wakeup()));
                rtp.set_last_packet_send_time(now_unix_millis().saturating_sub(60_000));

                let mut session = RtspSession::new("timeout-test");
                session.attach(rtp.clone());
                ctx.set_session(session);

                *self.rtp.lock().unwrap() = Some(rtp);
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_silent_stream_gets_bye_then_kick() {
        let config = ServerConfig::with_addr(loopback())
            .stream_timeouts(Duration::from_millis(100), Duration::from_millis(200));
        let server = start_server(
            config,
            IdleStream {
                rtp: StdMutex::new(None),
            },
        )
        .await;
        let port = server.bind_addr().port();
        let registry = server.registry().clone();

        let mut stream = connect(port).await;
        stream.write_all(b"x").await.unwrap();

        wait_for("client kicked", || registry.is_empty()).await;

        let rtp = server.handler.rtp.lock().unwrap().clone().unwrap();
        assert!(rtp.byes_sent() >= 1, "BYE must precede the kick");
        assert_eq!(server.default_vhost().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_excess() {
        let server = start_server(
            ServerConfig::with_addr(loopback()).max_connections(1),
            crate::LoggingHandler,
        )
        .await;
        let port = server.bind_addr().port();
        let registry = server.registry().clone();

        let _first = connect(port).await;
        wait_for("first client registered", || registry.len() == 1).await;

        // Second connection is refused at admission and closed
        let mut second = connect(port).await;
        let mut buf = [0u8; 16];
        let closed = time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(closed, Ok(0) | Err(_)));

        assert_eq!(registry.len(), 1);
        assert_eq!(server.stats().snapshot().total_connections, 1);
    }
}
