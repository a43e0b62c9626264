//! Shared RTSP session state
//!
//! Created by the RTSP layer on the first successful SETUP; absent before
//! that. The connection core treats the attached RTP sessions read-only
//! apart from the BYE bookkeeping the timeout monitor does.

use std::sync::Arc;

use crate::session::rtp::RtpSession;

/// RTSP session attached to a client connection
#[derive(Debug, Default)]
pub struct RtspSession {
    id: String,
    rtp_sessions: Vec<Arc<RtpSession>>,
}

impl RtspSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rtp_sessions: Vec::new(),
        }
    }

    /// Session identifier as carried in the Session header
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attach a newly set-up RTP session
    pub fn attach(&mut self, session: Arc<RtpSession>) {
        self.rtp_sessions.push(session);
    }

    /// Detach an RTP session by id, returning it if present
    pub fn detach(&mut self, rtp_id: u32) -> Option<Arc<RtpSession>> {
        let pos = self.rtp_sessions.iter().position(|s| s.id() == rtp_id)?;
        Some(self.rtp_sessions.remove(pos))
    }

    /// RTP sessions currently attached
    pub fn rtp_sessions(&self) -> &[Arc<RtpSession>] {
        &self.rtp_sessions
    }

    pub fn is_empty(&self) -> bool {
        self.rtp_sessions.is_empty()
    }
}
