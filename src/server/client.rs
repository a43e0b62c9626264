//! Per-client connection loop
//!
//! Manages the lifecycle of a single RTSP control connection:
//! 1. Socket setup
//! 2. Registration in the client registry
//! 3. The connection loop (reads, queued writes, stream-timeout checks)
//! 4. Teardown (unregister, vhost/stat bookkeeping, tunnel-pair handling)
//!
//! Exactly one task owns a `Client` from admission to teardown. Watchers
//! that fire after the loop has decided to exit are harmless: every exit
//! path funnels into the same teardown code, and the stop signal is
//! idempotent.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{self, MissedTickBehavior};

use crate::registry::ClientRegistry;
use crate::server::config::ServerConfig;
use crate::server::handler::RtspHandler;
use crate::session::rtp::{now_unix_millis, MediaSource, RtpSession};
use crate::session::ClientContext;
use crate::stats::ServerStats;

/// Read/write plumbing of one connection, fixed at admission
pub(crate) enum ClientTransport {
    Tcp {
        stream: TcpStream,
        /// Tail of the output queue lives with the senders; this end is
        /// drained FIFO by the loop below
        out_rx: mpsc::UnboundedReceiver<Bytes>,
    },
    #[cfg(feature = "sctp")]
    Sctp {
        socket: Arc<crate::transport::sctp::SctpSocket>,
    },
}

/// One admitted client connection, owned by its task
pub(crate) struct Client<H: RtspHandler> {
    pub(crate) ctx: ClientContext,
    pub(crate) transport: ClientTransport,
    pub(crate) stop_rx: watch::Receiver<bool>,
    pub(crate) handler: Arc<H>,
    pub(crate) registry: Arc<ClientRegistry>,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) config: ServerConfig,
    /// Connection-limit slot, released at teardown
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl<H: RtspHandler> Client<H> {
    /// Run the connection to completion; never returns early
    pub(crate) async fn run(mut self) {
        let mut admitted = false;
        match self.configure() {
            Ok(()) => {
                if self.handler.on_connection(&self.ctx).await {
                    admitted = true;
                } else {
                    tracing::debug!(client_id = %self.ctx.id(), "Connection rejected by handler");
                }
            }
            Err(e) => {
                // Setup failures (fd pressure, dead socket) skip the loop
                // entirely and fall through to teardown
                tracing::error!(
                    client_id = %self.ctx.id(),
                    error = %e,
                    "Client setup failed, skipping connection loop"
                );
            }
        }

        if admitted {
            self.registry.add(self.ctx.handle().clone());
            self.run_loop().await;
            self.registry.remove(self.ctx.id());
        }

        self.ctx.vhost().connection_closed();
        self.stats.connection_closed();

        // HTTP-tunnelled connections come in pairs. The side carrying RTSP
        // requests takes its sibling down with it; the other side going
        // away leaves the RTSP side running until its own disconnect.
        if let Some(pair) = self.ctx.handle().pair() {
            if pair.carries_rtsp() {
                tracing::debug!(
                    client_id = %self.ctx.id(),
                    sibling = %pair.sibling().id(),
                    "Stopping tunnelled sibling connection"
                );
                pair.sibling().stop();
            }
        }

        if admitted {
            self.handler.on_disconnect(&self.ctx).await;
        }

        drop(self.permit.take());
        tracing::info!(client_id = %self.ctx.id(), "Client removed");
    }

    fn configure(&self) -> std::io::Result<()> {
        match &self.transport {
            ClientTransport::Tcp { stream, .. } => {
                if self.config.tcp_nodelay {
                    stream.set_nodelay(true)?;
                }
                Ok(())
            }
            #[cfg(feature = "sctp")]
            ClientTransport::Sctp { .. } => Ok(()),
        }
    }

    async fn run_loop(&mut self) {
        let live_bye_ms = self.config.live_bye_timeout.as_millis() as u64;
        let hard_ms = self.config.stream_timeout.as_millis() as u64;

        // First check one full period after start, then repeating
        let mut timer = time::interval_at(
            time::Instant::now() + self.config.stream_timeout,
            self.config.stream_timeout,
        );
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ctx = &mut self.ctx;
        let handler = &self.handler;
        // The receiver handed out at admission: a stop posted before the
        // loop starts still shows up as a change here
        let stop_rx = &mut self.stop_rx;

        match &mut self.transport {
            ClientTransport::Tcp { stream, out_rx } => {
                let mut input = BytesMut::with_capacity(self.config.read_buffer_size);
                let (mut read, mut write) = stream.split();

                loop {
                    tokio::select! {
                        biased;

                        _ = stop_rx.changed() => {
                            tracing::debug!(client_id = %ctx.id(), "Stop requested");
                            break;
                        }

                        _ = timer.tick() => {
                            if check_stream_timeouts(ctx, handler, live_bye_ms, hard_ms).await {
                                break;
                            }
                        }

                        queued = out_rx.recv() => {
                            let Some(buf) = queued else { break };
                            let mut failed = write.write_all(&buf).await.is_err();
                            // Drain whatever else is already queued, in order
                            while !failed {
                                match out_rx.try_recv() {
                                    Ok(next) => failed = write.write_all(&next).await.is_err(),
                                    Err(_) => break,
                                }
                            }
                            if failed {
                                tracing::warn!(client_id = %ctx.id(), "Write failed");
                                break;
                            }
                        }

                        result = read.read_buf(&mut input) => {
                            match result {
                                Ok(0) => {
                                    tracing::debug!(client_id = %ctx.id(), "Disconnected");
                                    break;
                                }
                                Ok(_) => match handler.on_data(ctx, &mut input).await {
                                    Ok(true) => {}
                                    Ok(false) => {
                                        tracing::debug!(client_id = %ctx.id(), "Close requested by handler");
                                        break;
                                    }
                                    Err(e) => {
                                        tracing::warn!(client_id = %ctx.id(), error = %e, "Request handling failed");
                                        break;
                                    }
                                },
                                Err(e) => {
                                    tracing::warn!(client_id = %ctx.id(), error = %e, "Read failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            #[cfg(feature = "sctp")]
            ClientTransport::Sctp { socket } => {
                let mut buf = vec![0u8; self.config.read_buffer_size];

                loop {
                    tokio::select! {
                        biased;

                        _ = stop_rx.changed() => {
                            tracing::debug!(client_id = %ctx.id(), "Stop requested");
                            break;
                        }

                        _ = timer.tick() => {
                            if check_stream_timeouts(ctx, handler, live_bye_ms, hard_ms).await {
                                break;
                            }
                        }

                        result = socket.recv_message(&mut buf) => {
                            match result {
                                Ok((0, _)) => {
                                    tracing::debug!(client_id = %ctx.id(), "Disconnected");
                                    break;
                                }
                                Ok((len, stream_id)) => {
                                    let msg = Bytes::copy_from_slice(&buf[..len]);
                                    match handler.on_message(ctx, msg, stream_id).await {
                                        Ok(true) => {}
                                        Ok(false) => {
                                            tracing::debug!(client_id = %ctx.id(), "Close requested by handler");
                                            break;
                                        }
                                        Err(e) => {
                                            tracing::warn!(client_id = %ctx.id(), error = %e, "Request handling failed");
                                            break;
                                        }
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(client_id = %ctx.id(), error = %e, "Read failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Apply one timeout-monitor tick; returns true when the client must go
async fn check_stream_timeouts<H: RtspHandler>(
    ctx: &ClientContext,
    handler: &Arc<H>,
    live_bye_ms: u64,
    hard_ms: u64,
) -> bool {
    let Some(session) = ctx.session() else {
        return false;
    };

    let (soft, kick) =
        scan_rtp_sessions(session.rtp_sessions(), now_unix_millis(), live_bye_ms, hard_ms);

    for rtp in soft {
        tracing::info!(
            client_id = %ctx.id(),
            rtp_session = rtp.id(),
            "Soft stream timeout"
        );
        rtp.record_bye();
        handler.on_rtcp_bye(ctx, &rtp).await;
    }

    if kick {
        tracing::info!(client_id = %ctx.id(), "Stream timeout, client kicked off");
    }
    kick
}

/// Classify attached RTP sessions by idle time
///
/// A silent live stream past the BYE threshold is due a goodbye; this
/// happens when the live producer stops feeding us, or a stored stream
/// ended. Any stream silent past the hard threshold means the client
/// ignored us and gets kicked. The send stamp is left untouched, so a
/// stream that stays silent is told goodbye again on the next tick.
fn scan_rtp_sessions(
    sessions: &[Arc<RtpSession>],
    now: u64,
    live_bye_ms: u64,
    hard_ms: u64,
) -> (Vec<Arc<RtpSession>>, bool) {
    let mut soft = Vec::new();
    let mut kick = false;

    for session in sessions {
        let idle = session.idle_millis(now);
        if session.source() == MediaSource::Live && idle >= live_bye_ms {
            soft.push(session.clone());
        }
        if idle >= hard_ms {
            kick = true;
        }
    }

    (soft, kick)
}
