use super::error::PeerError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// The four per-connection flags, all initialized pessimistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    /// We are choking the peer.
    pub am_choking: bool,
    /// We told the peer we want its data.
    pub am_interested: bool,
    /// The peer is choking us.
    pub peer_choking: bool,
    /// The peer wants our data.
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

// One unchoke cycle. Released exactly once; a fresh gate replaces it so
// subsequent choke/unchoke rounds park new waiters cleanly.
struct Gate {
    released: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

impl Gate {
    fn new(released: bool) -> Arc<Self> {
        Arc::new(Self {
            released: AtomicBool::new(released),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Handle to one unchoke cycle of a connection.
///
/// Resolves when the next `unchoke` frame arrives, immediately if the
/// peer was not choking when the handle was taken, or with
/// [`PeerError::ConnectionClosed`] once the connection terminates.
#[derive(Clone)]
pub struct UnchokeHandle {
    gate: Arc<Gate>,
}

impl UnchokeHandle {
    fn ready() -> Self {
        Self {
            gate: Gate::new(true),
        }
    }

    pub fn is_released(&self) -> bool {
        self.gate.released.load(Ordering::Acquire)
    }

    /// Waits for the unchoke this handle tracks.
    pub async fn released(&self) -> Result<(), PeerError> {
        loop {
            // Register before checking so a release between the check and
            // the await cannot be missed.
            let notified = self.gate.notify.notified();
            if self.gate.released.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.gate.closed.load(Ordering::Acquire) {
                return Err(PeerError::ConnectionClosed);
            }
            notified.await;
        }
    }
}

struct StateInner {
    flags: ChokingState,
    gate: Arc<Gate>,
    interested_sent: bool,
    unchoked_once: bool,
    closed: bool,
}

/// Shared per-connection state: the four flags, the unchoke signal, and
/// the interested latch.
///
/// The read loop is the only writer of the remote-driven flags; external
/// tasks (the request scheduler) take unchoke handles and latch interest,
/// which is why the whole thing sits behind one mutex.
pub struct PeerState {
    inner: Mutex<StateInner>,
}

impl PeerState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                flags: ChokingState::default(),
                gate: Gate::new(false),
                interested_sent: false,
                unchoked_once: false,
                closed: false,
            }),
        }
    }

    /// Returns a copy of the current flags.
    pub fn flags(&self) -> ChokingState {
        self.inner.lock().flags
    }

    pub fn on_choke(&self) {
        // The current gate stays unreleased; future waiters park on it
        // until the next unchoke.
        self.inner.lock().flags.peer_choking = true;
    }

    pub fn on_unchoke(&self) {
        let mut inner = self.inner.lock();
        inner.flags.peer_choking = false;
        inner.unchoked_once = true;
        inner.gate.release();
        if !inner.closed {
            inner.gate = Gate::new(false);
        }
    }

    pub fn on_interested(&self, interested: bool) {
        self.inner.lock().flags.peer_interested = interested;
    }

    pub fn set_am_choking(&self, choking: bool) {
        self.inner.lock().flags.am_choking = choking;
    }

    /// Returns a handle for the next unchoke, already released if the
    /// peer is not currently choking us.
    pub fn unchoke_handle(&self) -> UnchokeHandle {
        let inner = self.inner.lock();
        Self::handle_locked(&inner)
    }

    /// Latches the interested flag. Returns whether this call was the
    /// first (and must transmit the frame) together with the unchoke
    /// handle the caller should wait on.
    pub fn latch_interest(&self) -> (bool, UnchokeHandle) {
        let mut inner = self.inner.lock();
        let first = !inner.interested_sent;
        inner.interested_sent = true;
        inner.flags.am_interested = true;
        let handle = Self::handle_locked(&inner);
        (first, handle)
    }

    fn handle_locked(inner: &StateInner) -> UnchokeHandle {
        if !inner.flags.peer_choking && !inner.closed {
            UnchokeHandle::ready()
        } else {
            UnchokeHandle {
                gate: inner.gate.clone(),
            }
        }
    }

    /// True once interest is latched and at least one unchoke has been
    /// observed; block requests are refused before that.
    pub fn may_request(&self) -> bool {
        let inner = self.inner.lock();
        inner.flags.am_interested && inner.unchoked_once && !inner.closed
    }

    /// Terminates the signal: all current and future waiters resolve with
    /// [`PeerError::ConnectionClosed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.gate.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for PeerState {
    fn default() -> Self {
        Self::new()
    }
}
