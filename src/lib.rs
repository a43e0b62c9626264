//! rtsp-core: client connection core for an RTSP streaming server
//!
//! This library owns the lifecycle of RTSP control connections:
//! - Accepting TCP (and optionally SCTP) connections and admitting clients
//! - A per-client connection loop with exclusive ownership of all
//!   per-connection state
//! - Stream-timeout monitoring across the RTP sessions of each client,
//!   with a soft RTCP BYE before the hard kick
//! - A process-wide registry of live clients with broadcast shutdown
//! - Teardown of RTSP-over-HTTP tunnelled connection pairs
//!
//! RTSP message parsing, method handling and RTP/RTCP packet formatting
//! live outside this crate, plugged in through the [`RtspHandler`] trait.
//!
//! # Example: Simple Server
//!
//! ```no_run
//! use rtsp_core::{LoggingHandler, RtspServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::with_addr("0.0.0.0:8554".parse()?);
//!     let server = RtspServer::new(config, LoggingHandler)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;
pub mod vhost;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use registry::{ClientHandle, ClientId, ClientRegistry, ClientWakeup};
pub use server::config::ServerConfig;
pub use server::handler::{LoggingHandler, RtspHandler};
pub use server::listener::RtspServer;
pub use session::{ClientContext, MediaSource, RtpSession, RtspSession};
pub use transport::{OutboundSink, TransportKind};
pub use vhost::VirtualHost;
