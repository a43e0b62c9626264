//! Process-wide registry of live client connections
//!
//! A client is present in the registry exactly while its connection loop is
//! running: the client task adds itself right before entering the loop and
//! removes itself on the way out. Everything else in the process only ever
//! sees [`ClientHandle`]s, whose operations are confined to posting wakeups
//! and writes into the owning task.
//!
//! Guarded by a plain mutex. The critical sections are a map operation or
//! one short closure per client; reader/writer machinery would cost more
//! than it saves at this contention level.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;

use crate::error::Result;
use crate::transport::OutboundSink;

/// Unique identifier for a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub(crate) fn new(id: u64) -> Self {
        ClientId(id)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One side of an HTTP-tunnelled client pair, as seen from the other side
#[derive(Clone)]
pub struct PairedClient {
    sibling: ClientHandle,
    carries_rtsp: bool,
}

impl PairedClient {
    /// Handle of the paired connection
    pub fn sibling(&self) -> &ClientHandle {
        &self.sibling
    }

    /// Whether the connection holding this link is the one carrying RTSP
    /// requests (the POST side of the tunnel)
    pub fn carries_rtsp(&self) -> bool {
        self.carries_rtsp
    }
}

struct HandleInner {
    id: ClientId,
    stop: watch::Sender<bool>,
    sink: OutboundSink,
    pair: Mutex<Option<PairedClient>>,
}

/// Cross-thread face of a client connection
///
/// Cheap to clone. Stopping is idempotent and safe from any thread; writing
/// goes through the connection's transport strategy. The client's private
/// state stays with its own task.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

impl ClientHandle {
    pub(crate) fn new(id: ClientId, stop: watch::Sender<bool>, sink: OutboundSink) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                stop,
                sink,
                pair: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// Ask the client's connection loop to exit
    ///
    /// One-shot in effect: repeated calls are harmless.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }

    /// Whether a stop has been posted
    pub fn is_stopped(&self) -> bool {
        *self.inner.stop.borrow()
    }

    /// Write side of the connection
    pub fn sink(&self) -> &OutboundSink {
        &self.inner.sink
    }

    /// Send a complete message to this client
    pub async fn write_data(&self, data: Bytes) -> Result<()> {
        self.inner.sink.send(data).await
    }

    /// Stop-only view of this handle, for media-side back-references
    pub fn wakeup(&self) -> ClientWakeup {
        ClientWakeup {
            handle: self.clone(),
        }
    }

    /// Pair link, if this connection is half of an HTTP tunnel
    pub fn pair(&self) -> Option<PairedClient> {
        self.inner.pair.lock().unwrap().clone()
    }

    /// Link the two TCP connections of an RTSP-over-HTTP tunnel
    ///
    /// `rtsp_side` is the POST connection carrying RTSP requests,
    /// `data_side` the GET connection carrying the reply stream. Both ends
    /// point at each other afterwards. When the POST side disconnects it
    /// stops the GET side as well; the GET side going away on its own
    /// leaves the POST side running.
    pub fn link_http_pair(rtsp_side: &ClientHandle, data_side: &ClientHandle) {
        *rtsp_side.inner.pair.lock().unwrap() = Some(PairedClient {
            sibling: data_side.clone(),
            carries_rtsp: true,
        });
        *data_side.inner.pair.lock().unwrap() = Some(PairedClient {
            sibling: rtsp_side.clone(),
            carries_rtsp: false,
        });
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.inner.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Back-reference from an RTP session to its owning client
///
/// The only operation media code may perform on a client it does not own is
/// waking its loop up to exit.
#[derive(Clone)]
pub struct ClientWakeup {
    handle: ClientHandle,
}

impl ClientWakeup {
    pub fn id(&self) -> ClientId {
        self.handle.id()
    }

    /// Stop the owning client's connection loop
    pub fn stop(&self) {
        self.handle.stop();
    }
}

impl fmt::Debug for ClientWakeup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientWakeup").field("id", &self.id()).finish()
    }
}

/// Set of live clients
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, handle: ClientHandle) {
        self.clients.lock().unwrap().insert(handle.id(), handle);
    }

    pub(crate) fn remove(&self, id: ClientId) -> bool {
        self.clients.lock().unwrap().remove(&id).is_some()
    }

    /// Look up a live client
    pub fn get(&self, id: ClientId) -> Option<ClientHandle> {
        self.clients.lock().unwrap().get(&id).cloned()
    }

    /// Number of live clients
    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().unwrap().is_empty()
    }

    /// Run `f` for every live client
    ///
    /// The registry mutex is held across the whole iteration: `f` must not
    /// touch the registry and should confine itself to posting wakeups.
    pub fn for_each<F: FnMut(&ClientHandle)>(&self, mut f: F) {
        let clients = self.clients.lock().unwrap();
        for handle in clients.values() {
            f(handle);
        }
    }

    /// Post a stop to every live client
    ///
    /// Each client then runs its ordinary teardown on its own task and
    /// removes itself from the registry; there is no forced-close path.
    pub fn shutdown(&self) {
        tracing::debug!(clients = self.len(), "Signalling shutdown to all clients");
        self.for_each(|client| client.stop());
    }
}
