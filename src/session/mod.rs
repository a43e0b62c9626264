//! Per-connection session state
//!
//! - [`ClientContext`]: the mutable state bundle handed to the RTSP layer
//! - [`RtspSession`]: shared session created at SETUP, owning RTP sessions
//! - [`RtpSession`]: one media stream, checked by the timeout monitor

pub mod context;
pub mod rtp;
pub mod rtsp;

pub use context::ClientContext;
pub use rtp::{MediaSource, RtpSession};
pub use rtsp::RtspSession;
