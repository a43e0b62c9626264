//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Seconds a live stream may stay silent before an RTCP BYE is sent
pub const DEFAULT_LIVE_BYE_TIMEOUT: Duration = Duration::from_secs(6);

/// Seconds any stream may stay silent before the client is kicked.
/// Large enough for a player to switch to another transmission protocol,
/// and a multiple of the BYE timeout so the BYE goes out first.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(12);

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the TCP control listener to
    pub bind_addr: SocketAddr,

    /// Address to bind the SCTP control listener to (None disables it)
    #[cfg(feature = "sctp")]
    pub sctp_bind_addr: Option<SocketAddr>,

    /// Maximum concurrent connections (0 = unlimited); meant to track the
    /// process file-descriptor limit
    pub max_connections: usize,

    /// Idle threshold after which a silent live stream gets an RTCP BYE
    pub live_bye_timeout: Duration,

    /// Idle threshold after which the client is kicked; also the period of
    /// the per-client timeout check. Must be an integer multiple (>= 2x)
    /// of `live_bye_timeout`.
    pub stream_timeout: Duration,

    /// Enable TCP_NODELAY on accepted control connections
    pub tcp_nodelay: bool,

    /// Initial capacity of the per-connection input buffer
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:554".parse().unwrap(),
            #[cfg(feature = "sctp")]
            sctp_bind_addr: None,
            max_connections: 0, // Unlimited
            live_bye_timeout: DEFAULT_LIVE_BYE_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            tcp_nodelay: true,
            read_buffer_size: 16 * 1024,
        }
    }
}

impl ServerConfig {
    /// Create a new config with a custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the SCTP bind address
    #[cfg(feature = "sctp")]
    pub fn sctp_bind(mut self, addr: SocketAddr) -> Self {
        self.sctp_bind_addr = Some(addr);
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set both stream timeouts
    pub fn stream_timeouts(mut self, live_bye: Duration, hard: Duration) -> Self {
        self.live_bye_timeout = live_bye;
        self.stream_timeout = hard;
        self
    }

    /// Check the timeout relationship
    ///
    /// The hard timeout must be `k * live_bye_timeout` with integer
    /// `k >= 2`, so a silent live stream is told goodbye at least once
    /// before the connection is kicked.
    pub fn validate(&self) -> Result<()> {
        let bye = self.live_bye_timeout.as_millis();
        let hard = self.stream_timeout.as_millis();

        if bye == 0 {
            return Err(Error::Config("live_bye_timeout must be non-zero".into()));
        }
        if hard % bye != 0 || hard / bye < 2 {
            return Err(Error::Config(format!(
                "stream_timeout ({:?}) must be an integer multiple (>= 2x) of live_bye_timeout ({:?})",
                self.stream_timeout, self.live_bye_timeout
            )));
        }
        Ok(())
    }
}
