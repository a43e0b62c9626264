//! RTSP handler trait
//!
//! The seam between the connection core and the RTSP protocol layer.
//! Request parsing, method dispatch and RTCP formatting all live behind
//! this trait; the core only moves bytes and runs the connection
//! lifecycle.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::session::{ClientContext, RtpSession};

/// Handler trait for the RTSP layer
///
/// All methods have default implementations, so a handler only needs to
/// override the callbacks it cares about.
#[async_trait]
pub trait RtspHandler: Send + Sync + 'static {
    /// Called when a connection has been admitted, before it starts
    /// serving. Return false to close it immediately; use this for
    /// IP-based limits or blocklists.
    async fn on_connection(&self, _ctx: &ClientContext) -> bool {
        true
    }

    /// Bytes arrived on a TCP control connection.
    ///
    /// The implementation owns RFC 2326 framing: consume complete requests
    /// from the front of `buf` and leave a partially received request in
    /// place for the next call. Responses go out through
    /// [`ClientContext::write_data`]. Return `Ok(false)` for an orderly
    /// close; an `Err` tears the connection down as a protocol failure.
    async fn on_data(&self, _ctx: &mut ClientContext, buf: &mut BytesMut) -> Result<bool> {
        buf.clear();
        Ok(true)
    }

    /// One complete message arrived on an SCTP control connection, with
    /// the stream id it was received on.
    async fn on_message(
        &self,
        _ctx: &mut ClientContext,
        _data: Bytes,
        _stream_id: u16,
    ) -> Result<bool> {
        Ok(true)
    }

    /// A live stream has gone silent: the RTCP layer should emit a sender
    /// report with BYE for this session. The connection stays up.
    async fn on_rtcp_bye(&self, _ctx: &ClientContext, _session: &RtpSession) {}

    /// The connection loop has exited; per-connection protocol state can
    /// be released.
    async fn on_disconnect(&self, _ctx: &ClientContext) {}
}

/// A handler that accepts everything and logs events
pub struct LoggingHandler;

#[async_trait]
impl RtspHandler for LoggingHandler {
    async fn on_connection(&self, ctx: &ClientContext) -> bool {
        tracing::info!(
            client_id = %ctx.id(),
            peer = %ctx.peer_addr(),
            transport = %ctx.transport(),
            "New connection"
        );
        true
    }

    async fn on_data(&self, ctx: &mut ClientContext, buf: &mut BytesMut) -> Result<bool> {
        tracing::debug!(client_id = %ctx.id(), bytes = buf.len(), "Received data");
        buf.clear();
        Ok(true)
    }

    async fn on_rtcp_bye(&self, ctx: &ClientContext, session: &RtpSession) {
        tracing::info!(
            client_id = %ctx.id(),
            rtp_session = session.id(),
            "Stream idle, BYE due"
        );
    }

    async fn on_disconnect(&self, ctx: &ClientContext) {
        tracing::info!(client_id = %ctx.id(), "Connection closed");
    }
}
