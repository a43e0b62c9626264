//! Transport strategies for client connections
//!
//! Two wire transports carry RTSP control traffic:
//! - TCP: byte-stream. Outgoing messages are queued per client and drained
//!   by the client's own task, so bytes hit the wire in enqueue order.
//! - SCTP (feature `sctp`): message-oriented. Each write is sent directly
//!   with a caller-chosen stream id; the kernel preserves per-stream
//!   ordering and there is no user-space queue.
//!
//! The strategy is fixed when the connection is admitted and never changes.

#[cfg(feature = "sctp")]
pub mod sctp;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

#[cfg(feature = "sctp")]
use std::sync::Arc;

/// SCTP stream carrying RTSP control messages; interleaved RTP uses
/// higher stream ids.
#[cfg(feature = "sctp")]
pub const SCTP_CONTROL_STREAM: u16 = 0;

/// Wire transport of a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    #[cfg(feature = "sctp")]
    Sctp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            #[cfg(feature = "sctp")]
            TransportKind::Sctp => write!(f, "sctp"),
        }
    }
}

/// Write side of a client connection
///
/// Cheap to clone; producers on other tasks (interleaved RTP senders) hold
/// clones and write without touching the client's private state. A message
/// handed to [`send`](OutboundSink::send) is owned by the sink from that
/// point on.
#[derive(Debug, Clone)]
pub enum OutboundSink {
    /// Queued writes, drained FIFO by the owning client task
    Tcp(mpsc::UnboundedSender<Bytes>),
    /// Direct message sends on the shared socket
    #[cfg(feature = "sctp")]
    Sctp(Arc<sctp::SctpSocket>),
}

impl OutboundSink {
    /// Create the queued TCP sink and the receiver its client drains
    pub(crate) fn queued() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (OutboundSink::Tcp(tx), rx)
    }

    /// Transport kind this sink writes through
    pub fn kind(&self) -> TransportKind {
        match self {
            OutboundSink::Tcp(_) => TransportKind::Tcp,
            #[cfg(feature = "sctp")]
            OutboundSink::Sctp(_) => TransportKind::Sctp,
        }
    }

    /// Send a complete message on the control channel
    ///
    /// TCP: enqueues and wakes the client task. SCTP: sends on the control
    /// stream. Fails with `ConnectionClosed` once the client is gone.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        match self {
            OutboundSink::Tcp(tx) => tx.send(data).map_err(|_| Error::ConnectionClosed),
            #[cfg(feature = "sctp")]
            OutboundSink::Sctp(sock) => {
                sock.send_message(SCTP_CONTROL_STREAM, &data).await?;
                Ok(())
            }
        }
    }

    /// Send a complete message on a specific SCTP stream
    ///
    /// On TCP the stream id is meaningless and the message is queued like
    /// any other; interleaved framing is the caller's business there.
    #[cfg(feature = "sctp")]
    pub async fn send_on(&self, stream_id: u16, data: Bytes) -> Result<()> {
        match self {
            OutboundSink::Tcp(tx) => tx.send(data).map_err(|_| Error::ConnectionClosed),
            OutboundSink::Sctp(sock) => {
                sock.send_message(stream_id, &data).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_sink_preserves_order() {
        let (sink, mut rx) = OutboundSink::queued();
        assert_eq!(sink.kind(), TransportKind::Tcp);

        sink.send(Bytes::from_static(b"first")).await.unwrap();
        sink.send(Bytes::from_static(b"second")).await.unwrap();
        sink.send(Bytes::from_static(b"third")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"third"));
    }

    #[tokio::test]
    async fn test_send_after_client_gone() {
        let (sink, rx) = OutboundSink::queued();
        drop(rx);

        let err = sink.send(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Tcp.to_string(), "tcp");
    }
}
